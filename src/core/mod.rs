//! Core module - instance model, lifecycle orchestration, and monitoring

mod instance;
mod manager;
mod monitor;
pub mod process;
pub mod settings;

pub use instance::{
    instance_id, sanitize_name, Instance, InstanceConfig, InstanceStats, InstanceStatus,
    ResourceUsage,
};
pub use manager::InstanceManager;
pub use monitor::ResourceMonitor;
pub use settings::FleetSettings;
