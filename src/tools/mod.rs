pub mod health_data;

pub use health_data::HealthDataTool;
