pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod forecast;
pub mod optimizer;
pub mod simulator;
pub mod sources;
pub mod telemetry;
pub mod timegrid;
