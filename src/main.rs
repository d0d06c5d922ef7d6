//! stackyard - Compose stacks on Docker Swarm and multi-architecture manifest lists
//!
//! This is the main CLI entry point.

use clap::{ArgAction, Parser, Subcommand};
use stackyard::compose::{self, get_config_details, LoadOptions};
use stackyard::config::{CliConfig, EngineEndpoint};
use stackyard::engine::EngineClient;
use stackyard::error::{Result, StackError};
use stackyard::manifest::commands as manifest;
use stackyard::manifest::{AnnotateOptions, CreateOptions, ManifestStore, MountPolicy, PushOptions};
use stackyard::proxy::{LabelScoper, ProxyListener, ProxyServer, RouteRegistry, PROJECT_LABEL};
use stackyard::registry::RegistryClient;
use stackyard::stack::{
    self, DeployOptions, Output, PsOptions, RemoveOptions, ResolveImage, ServicesOptions,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Compose stacks, manifest lists and a namespace proxy for Docker engines
#[derive(Parser)]
#[command(name = "stackyard")]
#[command(version)]
#[command(about = "Compose stacks on Docker Swarm and multi-architecture manifest lists", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short = 'D', long, global = true)]
    debug: bool,

    /// Logging level when RUST_LOG is not set
    #[arg(
        short = 'l',
        long,
        global = true,
        default_value = "warn",
        value_parser = ["debug", "info", "warn", "error", "fatal"]
    )]
    log_level: String,

    /// Engine socket to connect to
    #[arg(short = 'H', long = "host", global = true)]
    host: Option<String>,

    /// Location of the client config files
    #[arg(long, global = true, env = "DOCKER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage Swarm stacks
    Stack {
        #[command(subcommand)]
        command: StackCommands,
    },

    /// Manage manifest lists
    Manifest {
        #[command(subcommand)]
        command: ManifestCommands,
    },

    /// Confine engine API clients to one project
    Proxy {
        /// Project name resources are scoped to
        #[arg(long)]
        project: String,
        /// Address to listen on (unix:///path or tcp://host:port)
        #[arg(long)]
        listen: String,
        /// Label carrying the project name
        #[arg(long, default_value = PROJECT_LABEL)]
        label_key: String,
        /// Engine to forward to; defaults to --host
        #[arg(long)]
        upstream: Option<String>,
    },
}

#[derive(Subcommand)]
enum StackCommands {
    /// Deploy a new stack or update an existing stack
    #[command(alias = "up")]
    Deploy {
        /// Stack name
        stack: String,
        /// Path to a Compose file, or "-" to read from stdin
        #[arg(short = 'c', long = "compose-file")]
        compose_file: Vec<String>,
        /// Send registry authentication details to Swarm agents
        #[arg(long)]
        with_registry_auth: bool,
        /// Prune services that are no longer referenced
        #[arg(long)]
        prune: bool,
        /// Query the registry to resolve image digest and supported platforms
        #[arg(long, value_enum, default_value_t = ResolveImage::Always)]
        resolve_image: ResolveImage,
        /// Exit immediately instead of waiting for the services to converge
        #[arg(
            short,
            long,
            default_value_t = true,
            action = ArgAction::Set,
            num_args = 0..=1,
            default_missing_value = "true"
        )]
        detach: bool,
        /// Suppress progress output
        #[arg(short, long)]
        quiet: bool,
    },

    /// Output the final config file, after doing merges and interpolations
    Config {
        /// Path to a Compose file, or "-" to read from stdin
        #[arg(short = 'c', long = "compose-file")]
        compose_file: Vec<String>,
        /// Skip interpolation and output only merged config
        #[arg(long)]
        skip_interpolation: bool,
    },

    /// List stacks
    #[command(name = "ls", alias = "list")]
    List {
        /// Format output using a custom template
        #[arg(long)]
        format: Option<String>,
    },

    /// List the services in the stack
    Services {
        /// Stack name
        stack: String,
        /// Only display IDs
        #[arg(short, long)]
        quiet: bool,
        /// Filter output based on conditions provided
        #[arg(short, long)]
        filter: Vec<String>,
        /// Format output using a custom template
        #[arg(long)]
        format: Option<String>,
    },

    /// List the tasks in the stack
    Ps {
        /// Stack name
        stack: String,
        /// Only display task IDs
        #[arg(short, long)]
        quiet: bool,
        /// Filter output based on conditions provided
        #[arg(short, long)]
        filter: Vec<String>,
        /// Do not truncate output
        #[arg(long)]
        no_trunc: bool,
        /// Do not map IDs to names
        #[arg(long)]
        no_resolve: bool,
        /// Format output using a custom template
        #[arg(long)]
        format: Option<String>,
    },

    /// Remove one or more stacks
    #[command(name = "rm", aliases = ["remove", "down"])]
    Remove {
        /// Stack names
        #[arg(required = true)]
        stacks: Vec<String>,
        /// Do not wait for stack removal
        #[arg(
            short,
            long,
            default_value_t = true,
            action = ArgAction::Set,
            num_args = 0..=1,
            default_missing_value = "true"
        )]
        detach: bool,
    },
}

#[derive(Subcommand)]
enum ManifestCommands {
    /// Create a local manifest list for annotating and pushing to a registry
    Create {
        /// Manifest list name
        list: String,
        /// Images to include
        #[arg(required = true)]
        images: Vec<String>,
        /// Amend an existing manifest list
        #[arg(short, long)]
        amend: bool,
        /// Allow communication with an insecure registry
        #[arg(long)]
        insecure: bool,
    },

    /// Add additional information to a local image manifest
    Annotate {
        /// Manifest list name
        list: String,
        /// Image in the list
        image: String,
        /// Set operating system
        #[arg(long)]
        os: Option<String>,
        /// Set architecture
        #[arg(long)]
        arch: Option<String>,
        /// Set architecture variant
        #[arg(long)]
        variant: Option<String>,
        /// Set operating system version
        #[arg(long)]
        os_version: Option<String>,
        /// Set operating system feature
        #[arg(long, value_delimiter = ',')]
        os_features: Vec<String>,
    },

    /// Display an image manifest, or manifest list
    Inspect {
        /// [MANIFEST_LIST] MANIFEST
        #[arg(required = true, num_args = 1..=2)]
        refs: Vec<String>,
        /// Output additional info including layers and platform
        #[arg(short, long)]
        verbose: bool,
        /// Allow communication with an insecure registry
        #[arg(long)]
        insecure: bool,
    },

    /// Push a manifest list to a repository
    Push {
        /// Manifest list name
        #[arg(required_unless_present = "file", conflicts_with = "file")]
        list: Option<String>,
        /// Push a list described by a YAML file
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Remove the local manifest list after push
        #[arg(short, long)]
        purge: bool,
        /// Allow push to an insecure registry
        #[arg(long)]
        insecure: bool,
        /// Blobs the registry may copy instead of mounting
        #[arg(long, value_enum, default_value_t = MountPolicy::TolerateForeignLayers)]
        mount_policy: MountPolicy,
    },

    /// Delete one or more manifest lists from local storage
    Rm {
        /// Manifest list names
        #[arg(required = true)]
        lists: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = parse_error_code(&e);
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        let level = match cli.log_level.as_str() {
            "fatal" => "error",
            other => other,
        };
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let output = Output::stdio();
    match run(cli, &output).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            output.err(&e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

/// `--help` and `--version` succeed; every other parse failure is a usage error
fn parse_error_code(err: &clap::Error) -> u8 {
    if err.use_stderr() {
        StackError::Usage(err.to_string()).exit_code() as u8
    } else {
        0
    }
}

async fn run(cli: Cli, output: &Output) -> Result<()> {
    let cli_config = match &cli.config {
        Some(dir) => CliConfig::load_from(dir)?,
        None => CliConfig::load()?,
    };

    match cli.command {
        Commands::Stack { command } => run_stack(command, cli.host.as_deref(), &cli_config, output).await,
        Commands::Manifest { command } => run_manifest(command, &cli_config, output).await,
        Commands::Proxy {
            project,
            listen,
            label_key,
            upstream,
        } => {
            let upstream = EngineEndpoint::resolve(upstream.as_deref().or(cli.host.as_deref()))?;
            let listener = ProxyListener::bind(&EngineEndpoint::parse(&listen)?).await?;
            let scoper = Arc::new(LabelScoper::new(project, label_key));
            let server = ProxyServer::new(RouteRegistry::standard(), scoper, upstream);

            tokio::select! {
                result = server.serve(listener) => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down namespace proxy");
                    Ok(())
                }
            }
        }
    }
}

async fn connect(host: Option<&str>) -> Result<EngineClient> {
    let endpoint = EngineEndpoint::resolve(host)?;
    debug!(endpoint = %endpoint, "connecting to engine");
    EngineClient::connect(endpoint).await
}

async fn run_stack(
    command: StackCommands,
    host: Option<&str>,
    cli_config: &CliConfig,
    output: &Output,
) -> Result<()> {
    match command {
        StackCommands::Deploy {
            stack: namespace,
            compose_file,
            with_registry_auth,
            prune,
            resolve_image,
            detach,
            quiet,
        } => {
            stack::validate_stack_name(&namespace)?;
            let details = get_config_details(&compose_file, std::io::stdin())?;
            let loaded = compose::load(&details, &LoadOptions::default())?;
            for message in loaded.report.messages() {
                output.err(message);
            }

            let engine = connect(host).await?;
            let options = DeployOptions {
                namespace,
                prune,
                send_registry_auth: with_registry_auth,
                resolve_image,
                detach,
                quiet,
                progress: Default::default(),
            };
            stack::deploy(&engine, cli_config, &loaded.config, &options, output).await
        }

        StackCommands::Config {
            compose_file,
            skip_interpolation,
        } => {
            let details = get_config_details(&compose_file, std::io::stdin())?;
            let loaded = compose::load(&details, &LoadOptions { skip_interpolation })?;
            output.out_raw(&serde_yaml::to_string(&loaded.config)?);
            Ok(())
        }

        StackCommands::List { format } => {
            let engine = connect(host).await?;
            stack::list_stacks(&engine, format.as_deref(), output).await
        }

        StackCommands::Services {
            stack: namespace,
            quiet,
            filter,
            format,
        } => {
            let engine = connect(host).await?;
            let options = ServicesOptions {
                namespace,
                quiet,
                format,
                filters: filter,
            };
            stack::services(&engine, &options, output).await
        }

        StackCommands::Ps {
            stack: namespace,
            quiet,
            filter,
            no_trunc,
            no_resolve,
            format,
        } => {
            let engine = connect(host).await?;
            let options = PsOptions {
                namespace,
                quiet,
                format,
                filters: filter,
                no_resolve,
                no_trunc,
            };
            stack::ps(&engine, &options, output).await
        }

        StackCommands::Remove { stacks, detach } => {
            let engine = connect(host).await?;
            let options = RemoveOptions {
                namespaces: stacks,
                detach,
                ..Default::default()
            };
            stack::remove(&engine, &options, output).await
        }
    }
}

async fn run_manifest(command: ManifestCommands, cli_config: &CliConfig, output: &Output) -> Result<()> {
    let store = ManifestStore::new(cli_config.manifest_store_root());
    let registry = |insecure: bool| RegistryClient::new(cli_config.clone(), insecure);

    match command {
        ManifestCommands::Create {
            list,
            images,
            amend,
            insecure,
        } => {
            manifest::create(
                &store,
                &registry(insecure),
                &list,
                &images,
                &CreateOptions { amend },
                output,
            )
            .await
        }

        ManifestCommands::Annotate {
            list,
            image,
            os,
            arch,
            variant,
            os_version,
            os_features,
        } => {
            let options = AnnotateOptions {
                os,
                arch,
                variant,
                os_version,
                os_features,
            };
            manifest::annotate(&store, &list, &image, &options)
        }

        ManifestCommands::Inspect {
            refs,
            verbose,
            insecure,
        } => {
            let (list, image) = match refs.as_slice() {
                [image] => (None, image),
                [list, image] => (Some(list.as_str()), image),
                _ => {
                    return Err(StackError::Usage(
                        "manifest inspect requires one or two references".to_string(),
                    ))
                }
            };
            manifest::inspect(&store, &registry(insecure), list, image, verbose, output).await
        }

        ManifestCommands::Push {
            list,
            file,
            purge,
            insecure,
            mount_policy,
        } => {
            let options = PushOptions { purge, mount_policy };
            match (list, file) {
                (_, Some(path)) => manifest::push_file(&registry(insecure), &path, &options, output).await,
                (Some(list), None) => manifest::push_list(&store, &registry(insecure), &list, &options, output).await,
                (None, None) => Err(StackError::Usage(
                    "manifest push requires a list name or --file".to_string(),
                )),
            }
        }

        ManifestCommands::Rm { lists } => manifest::remove(&store, &lists),
    }
}
