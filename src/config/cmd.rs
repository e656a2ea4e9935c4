use std::path::PathBuf;

use clap::Parser;

use crate::builder::containerizer::DEFAULT_TOOL_NAME;

#[derive(Parser, Debug)]
#[command(name = "fibpack", about = "Builds container images without a Docker daemon", version)]
pub enum CmdArgs {
    /// Build the image into a tarball that `docker load` accepts
    Tar(TarCmdArgs),
    /// Build the image and load it into the local Docker daemon
    Daemon(CommonArgs),
    /// Build the image and push it to the registry of the target image
    Push(CommonArgs),
}

#[derive(clap::Args, Debug)]
pub struct TarCmdArgs {
    /// Where to write the tarball
    pub output: PathBuf,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(clap::Args, Debug)]
pub struct CommonArgs {
    /// JSON build configuration
    #[arg(long)]
    pub config_file: PathBuf,

    /// Name recorded in the image history and the User-Agent
    #[arg(long, default_value = DEFAULT_TOOL_NAME)]
    pub tool_name: String,
}

/// The sink picked on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildTarget {
    Tar(PathBuf),
    Daemon,
    Push,
}

impl CmdArgs {
    pub fn into_parts(self) -> (CommonArgs, BuildTarget) {
        match self {
            CmdArgs::Tar(TarCmdArgs { output, common }) => (common, BuildTarget::Tar(output)),
            CmdArgs::Daemon(common) => (common, BuildTarget::Daemon),
            CmdArgs::Push(common) => (common, BuildTarget::Push),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tar_takes_the_output_path() {
        let args = CmdArgs::try_parse_from(["fibpack", "tar", "out/image.tar", "--config-file", "build.json"]).unwrap();
        let (common, target) = args.into_parts();
        assert_eq!(target, BuildTarget::Tar(PathBuf::from("out/image.tar")));
        assert_eq!(common.config_file, PathBuf::from("build.json"));
        assert_eq!(common.tool_name, "fibpack");
    }

    #[test]
    fn config_file_is_required() {
        assert!(CmdArgs::try_parse_from(["fibpack", "push"]).is_err());
        let args = CmdArgs::try_parse_from(["fibpack", "daemon", "--config-file", "b.json", "--tool-name", "gradle-fib"]).unwrap();
        let (common, target) = args.into_parts();
        assert_eq!((common.tool_name.as_str(), target), ("gradle-fib", BuildTarget::Daemon));
    }
}
