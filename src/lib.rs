//! Builds OCI and Docker container images from files on disk and pushes
//! them to a registry, loads them into a Docker daemon or writes them as a
//! tarball, all without a Docker daemon doing the build.

pub mod blob;
pub mod builder;
pub mod cache;
pub mod config;
pub mod credential;
pub mod docker;
pub mod event;
pub mod http;
pub mod image;
pub mod init;
pub mod layer;
pub mod registry;
pub mod util;
