pub mod connection;
pub mod detector;
pub mod metrics;
pub mod orchestrator;
pub mod report;
pub mod sampler;
pub mod settings;
pub mod worker;
