pub mod client;
pub mod tarball;

pub use client::DockerClient;
pub use tarball::{ImageTarball, TarballLayer};
