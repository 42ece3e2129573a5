//! Command line interface.
//!
//! ```sh
//! udock run [OPTIONS] <container> [cmd...]
//! udock setup --execmode=F3 [--force] <container>
//! udock mode <container>
//! ```
//!
//! Only the execution core is exposed: image pulls, imports and the
//! repository management commands live elsewhere.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing::{debug, info};

use crate::config::Config;
use crate::engines::common::EngineCommon;
use crate::engines::proot::NoSeccompEnv;
use crate::error::{Error, Result};
use crate::execmode::{ExecutionMode, create_engine};
use crate::options::{RunOptions, validate_user_str};
use crate::platform::HostInfo;
use crate::repository::{LocalRepository, Repository};

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
#[command(name = "udock", version, about = "Run containers as an unprivileged user")]
pub struct Cli {
    /// Verbose logging, also forwarded to the backend
    #[arg(long, short = 'D', global = true)]
    pub debug: bool,

    /// Only log errors
    #[arg(long, short, global = true, conflicts_with = "debug")]
    pub quiet: bool,

    /// Configuration file
    #[arg(long, global = true, env = "UDOCK_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a command inside a container
    Run(RunArgs),
    /// Change the execution mode of a container
    Setup(SetupArgs),
    /// Print the execution mode of a container
    Mode(ModeArgs),
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Container id or name
    pub container: String,

    /// Command and arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub cmd: Vec<String>,

    /// Bind HOST[:CONTAINER[:rw]] into the container
    #[arg(long, short)]
    pub volume: Vec<String>,

    /// Do not bind this path
    #[arg(long)]
    pub novol: Vec<String>,

    /// Set NAME=VALUE in the container environment
    #[arg(long, short)]
    pub env: Vec<String>,

    /// Pass the host environment through
    #[arg(long)]
    pub hostenv: bool,

    /// Run as NAME, UID or UID:GID
    #[arg(long, short)]
    pub user: Option<String>,

    /// Working directory inside the container
    #[arg(long, short)]
    pub workdir: Option<String>,

    /// Override the image entrypoint, "" disables it
    #[arg(long)]
    pub entrypoint: Option<String>,

    #[arg(long)]
    pub hostname: Option<String>,

    #[arg(long)]
    pub domain: Option<String>,

    /// Map HOST:CONTAINER[/proto] ports
    #[arg(long, short)]
    pub publish: Vec<String>,

    /// Expose PORT[/proto]
    #[arg(long)]
    pub expose: Vec<String>,

    /// Cooperative network namespace
    #[arg(long)]
    pub netcoop: bool,

    /// Use the host passwd and group files
    #[arg(long)]
    pub hostauth: bool,

    /// Use the container passwd and group files unmodified
    #[arg(long)]
    pub containerauth: bool,

    /// Bind the invoking user's home directory
    #[arg(long)]
    pub bindhome: bool,

    /// Do not bind the default system directories
    #[arg(long)]
    pub nosysdirs: bool,

    /// Ignore the image metadata
    #[arg(long)]
    pub nometa: bool,

    /// Bind the GPU device directories
    #[arg(long)]
    pub dri: bool,

    /// CPUs to pin the run to
    #[arg(long = "cpuset-cpus")]
    pub cpuset: Option<String>,

    /// Run a directory tree instead of a repository container
    #[arg(long)]
    pub location: Option<PathBuf>,

    /// Kernel release reported inside PRoot
    #[arg(long)]
    pub kernel: Option<String>,
}

#[derive(Args, Debug)]
pub struct SetupArgs {
    /// Container id or name
    pub container: String,

    /// New execution mode
    #[arg(long)]
    pub execmode: String,

    /// Redo the preparation even if the mode is unchanged
    #[arg(long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct ModeArgs {
    /// Container id or name
    pub container: String,
}

impl RunArgs {
    /// Validated [`RunOptions`] for this command line.
    pub fn to_run_options(&self) -> Result<RunOptions> {
        let mut opt = RunOptions::default();
        for spec in &self.volume {
            opt.add_volume(spec)?;
        }
        opt.novol = self.novol.clone();
        for entry in &self.env {
            opt.env
                .append(entry)
                .map_err(|_| Error::InvalidOption(format!("--env={}", entry)))?;
        }
        opt.hostenv = self.hostenv;

        if let Some(user) = &self.user {
            validate_user_str(user)?;
            opt.user = user.clone();
        }
        if let Some(workdir) = &self.workdir {
            if !workdir.starts_with('/') {
                return Err(Error::InvalidWorkdir(workdir.clone()));
            }
            opt.cwd = workdir.clone();
        }
        if let Some(entrypoint) = &self.entrypoint {
            opt.set_entrypoint(entrypoint);
        }

        opt.hostname = self.hostname.clone().unwrap_or_default();
        opt.domain = self.domain.clone().unwrap_or_default();
        opt.portsmap = self.publish.clone();
        opt.portsexp = self.expose.clone();
        opt.netcoop = self.netcoop;
        opt.hostauth = self.hostauth;
        opt.containerauth = self.containerauth;
        opt.bindhome = self.bindhome;
        opt.nosysdirs = self.nosysdirs;
        opt.nometa = self.nometa;
        opt.dri = self.dri;
        opt.cpuset = self.cpuset.clone().unwrap_or_default();
        opt.location = self.location.clone();
        opt.kernel = self.kernel.clone().unwrap_or_default();
        opt.cmd = self.cmd.clone();
        Ok(opt)
    }
}

// =============================================================================
// Image references
// =============================================================================

/// Parts of an image reference `[transport//][host/]image[:tag]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageSpec {
    pub transport: String,
    pub hostname: String,
    pub image: String,
    pub tag: String,
}

/// Splits an image reference.
///
/// The first path component is taken as a registry host when more
/// components follow; the tag is whatever follows the last `:` of the
/// final component.
pub fn split_imagespec(imagespec: &str) -> ImageSpec {
    let mut spec = ImageSpec::default();
    if imagespec.is_empty() {
        return spec;
    }

    let rest = match imagespec.split_once("//") {
        Some((transport, rest)) => {
            spec.transport = transport.to_string();
            rest
        }
        None => imagespec,
    };
    let rest = match rest.split_once('/') {
        Some((host, image)) => {
            spec.hostname = host.to_string();
            image
        }
        None => rest,
    };
    let last_component = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
    match rest[last_component..].rfind(':') {
        Some(i) => {
            let split = last_component + i;
            spec.image = rest[..split].to_string();
            spec.tag = rest[split + 1..].to_string();
        }
        None => spec.image = rest.to_string(),
    }
    spec
}

// =============================================================================
// Dispatch
// =============================================================================

/// Executes a parsed command line and returns the process exit code.
pub async fn dispatch(cli: Cli, config: Arc<Config>) -> Result<i32> {
    let host = Arc::new(HostInfo::detect());
    let local = LocalRepository::new(&config);
    local.setup()?;
    let repo: Arc<dyn Repository> = Arc::new(local);

    match cli.cmd {
        Commands::Run(args) => {
            let opt = args.to_run_options()?;
            if let Some(location) = opt.location.clone() {
                debug!("Running directory tree {}", location.display());
                let mode = config.default_execution_mode;
                let common = EngineCommon::new(Arc::clone(&config), host, repo, mode, opt);
                let mut engine = create_engine(common, Arc::new(NoSeccompEnv));
                return engine.run(&args.container).await;
            }
            let exec_mode = ExecutionMode::new(config, host, repo, &args.container)?;
            let container_id = exec_mode.container_id().to_string();
            let mut engine = exec_mode.get_engine(opt);
            engine.run(&container_id).await
        }
        Commands::Setup(args) => {
            let mut exec_mode = ExecutionMode::new(config, host, repo, &args.container)?;
            if args.force {
                exec_mode.set_mode_forced(&args.execmode)?;
            } else {
                exec_mode.set_mode(&args.execmode)?;
            }
            info!("Execution mode of {} is {}", args.container, exec_mode.get_mode());
            Ok(0)
        }
        Commands::Mode(args) => {
            let exec_mode = ExecutionMode::new(config, host, repo, &args.container)?;
            println!("{}", exec_mode.get_mode());
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(transport: &str, hostname: &str, image: &str, tag: &str) -> ImageSpec {
        ImageSpec {
            transport: transport.into(),
            hostname: hostname.into(),
            image: image.into(),
            tag: tag.into(),
        }
    }

    #[test]
    fn test_split_imagespec() {
        assert_eq!(split_imagespec(""), ImageSpec::default());
        assert_eq!(
            split_imagespec("dockerhub.io/myimg:1.2"),
            spec("", "dockerhub.io", "myimg", "1.2")
        );
        assert_eq!(
            split_imagespec("https://dockerhub.io/myimg:1.2"),
            spec("https:", "dockerhub.io", "myimg", "1.2")
        );
        assert_eq!(split_imagespec("centos"), spec("", "", "centos", ""));
        assert_eq!(
            split_imagespec("quay.io/org/app:v1"),
            spec("", "quay.io", "org/app", "v1")
        );
    }

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::try_parse_from([
            "udock", "run", "-v", "/data:/mnt", "-e", "FOO=bar", "--user", "1000:100", "-w", "/tmp",
            "--hostauth", "mycontainer", "ls", "-la",
        ])
        .unwrap();
        let Commands::Run(args) = cli.cmd else {
            panic!("expected run");
        };
        assert_eq!(args.container, "mycontainer");
        assert_eq!(args.cmd, vec!["ls", "-la"]);

        let opt = args.to_run_options().unwrap();
        assert_eq!(opt.vol.len(), 1);
        assert_eq!(opt.env.get("FOO"), Some("bar"));
        assert_eq!(opt.user, "1000:100");
        assert_eq!(opt.cwd, "/tmp");
        assert!(opt.hostauth);
        assert!(opt.entryp.is_none());
    }

    #[test]
    fn test_run_options_rejected() {
        let bad_user = RunArgs {
            user: Some("a:b:c".into()),
            ..Default::default()
        };
        assert!(matches!(bad_user.to_run_options(), Err(Error::InvalidUser(_))));

        let bad_cwd = RunArgs {
            workdir: Some("relative".into()),
            ..Default::default()
        };
        assert!(matches!(bad_cwd.to_run_options(), Err(Error::InvalidWorkdir(_))));

        let bad_env = RunArgs {
            env: vec!["NOEQUALS".into()],
            ..Default::default()
        };
        assert!(matches!(bad_env.to_run_options(), Err(Error::InvalidOption(_))));
    }

    #[test]
    fn test_empty_entrypoint_disables() {
        let args = RunArgs {
            entrypoint: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(args.to_run_options().unwrap().entryp, Some(vec![]));
    }

    #[test]
    fn test_parse_setup_command() {
        let cli = Cli::try_parse_from(["udock", "setup", "--execmode=F3", "--force", "c1"]).unwrap();
        let Commands::Setup(args) = cli.cmd else {
            panic!("expected setup");
        };
        assert_eq!(args.execmode, "F3");
        assert!(args.force);
        assert!(Cli::try_parse_from(["udock", "setup", "c1"]).is_err());
    }
}
