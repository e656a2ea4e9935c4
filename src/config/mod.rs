pub mod build_config;
pub mod cmd;
