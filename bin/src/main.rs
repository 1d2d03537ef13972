#![deny(clippy::uninlined_format_args)]
#![deny(clippy::unwrap_used)]
#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

use std::process::ExitCode;
use std::str::FromStr;

use async_trait::async_trait;
use clap::{
    builder::{styling::AnsiColor, Styles},
    Parser,
};
use color_eyre::eyre::{bail, Context, Result};
use derive_more::Debug;
use occystrap_lib::{
    element::Consumer,
    error::UriParseError,
    filter::Search,
    pipeline::{build_chain, run, Filter, Source},
    sink, source,
    transform::Compression,
    Authentication, Element, Filters, Platform, Reference,
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{self, prelude::*, Layer, Registry};

mod filterspec;
mod uri;

use uri::Uri;

#[derive(Debug, Parser)]
#[command(version, about, styles = style())]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Parser)]
enum Commands {
    /// Move a container image from SOURCE to DEST, applying filters in order
    Process(ProcessArgs),

    /// Search every layer of SOURCE for tar members matching PATTERN
    Search(SearchArgs),
}

#[derive(Debug, Parser)]
struct ProcessArgs {
    /// Where the image is read from, e.g. registry://docker.io/library/ubuntu:latest
    source: String,

    /// Where the image is written to, e.g. tar:///tmp/out.tar
    dest: String,

    /// A filter to apply, in the form name[:opt1=val1[,opt2=val2...]]. May be
    /// given multiple times; filters run in the order given.
    #[arg(short = 'f', long = "filter")]
    filters: Vec<String>,

    #[command(flatten)]
    global: Global,
}

#[derive(Debug, Parser)]
struct SearchArgs {
    /// Where the image is read from
    source: String,

    /// Pattern to match tar member paths against
    pattern: String,

    /// Treat PATTERN as a regular expression instead of a glob
    #[arg(long)]
    regex: bool,

    /// Emit matches as a machine-parseable (JSON) log stream instead of the
    /// human-readable tree
    #[arg(long)]
    script_friendly: bool,

    #[command(flatten)]
    global: Global,
}

#[derive(Debug, Parser)]
struct Global {
    /// Increase logging verbosity
    #[arg(long, short, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Operating system to select, when SOURCE is multi-platform (e.g. linux)
    #[arg(long, global = true)]
    os: Option<String>,

    /// CPU architecture to select, when SOURCE is multi-platform (e.g. amd64)
    #[arg(long, global = true)]
    architecture: Option<String>,

    /// Platform variant to select (e.g. v7)
    #[arg(long, global = true)]
    variant: Option<String>,

    /// Registry username, overridden by credentials embedded in SOURCE/DEST
    #[arg(long, global = true, env = "OCCYSTRAP_USERNAME")]
    username: Option<String>,

    /// Registry password, overridden by credentials embedded in SOURCE/DEST
    #[arg(long, global = true, env = "OCCYSTRAP_PASSWORD")]
    #[debug(skip)]
    password: Option<String>,

    /// Allow falling back to plain HTTP against a registry
    #[arg(long, global = true)]
    insecure: bool,

    /// Compression to use when writing layers to a registry
    #[arg(long, global = true, env = "OCCYSTRAP_COMPRESSION", default_value = "gzip", value_parser = Compression::from_str)]
    compression: Compression,

    /// Number of layers to transfer concurrently
    #[arg(long, global = true, default_value_t = 4)]
    parallel: usize,
}

#[tokio::main]
async fn main() -> ExitCode {
    color_eyre::install().expect("install color_eyre");

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            err.print().expect("print clap usage error");
            return ExitCode::from(2);
        }
    };

    let script_friendly = matches!(&cli.command, Commands::Search(opts) if opts.script_friendly);
    let verbose = match &cli.command {
        Commands::Process(opts) => opts.global.verbose,
        Commands::Search(opts) => opts.global.verbose,
    };
    init_logging(verbose, script_friendly);

    let result = match cli.command {
        Commands::Process(opts) => process(opts).await,
        Commands::Search(opts) => search(opts).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) if err.downcast_ref::<UriParseError>().is_some() => {
            eprintln!("{err:?}");
            ExitCode::from(2)
        }
        Err(err) => {
            eprintln!("{err:?}");
            ExitCode::FAILURE
        }
    }
}

#[tracing::instrument(skip(opts))]
async fn process(opts: ProcessArgs) -> Result<()> {
    let source_uri: Uri = opts.source.parse().context("parse SOURCE")?;
    let dest_uri: Uri = opts.dest.parse().context("parse DEST")?;

    let filters = opts
        .filters
        .iter()
        .map(|spec| filterspec::parse(spec))
        .collect::<Result<Vec<Box<dyn Filter>>>>()
        .context("parse filters")?;

    let source = build_source(source_uri, &opts.global).await.context("build source")?;
    let sink = build_sink(dest_uri, &opts.global).await.context("build destination")?;

    let consumer = build_chain(filters, sink);
    run(source, consumer).await.context("run pipeline")
}

#[tracing::instrument(skip(opts))]
async fn search(opts: SearchArgs) -> Result<()> {
    let source_uri: Uri = opts.source.parse().context("parse SOURCE")?;
    let source = build_source(source_uri, &opts.global).await.context("build source")?;

    let patterns = if opts.regex {
        Filters::parse_regex([&opts.pattern]).context("parse search regex")?
    } else {
        Filters::parse_glob([&opts.pattern]).context("parse search glob")?
    };
    let filters: Vec<Box<dyn Filter>> = vec![Box::new(Search::new(patterns))];
    let consumer = build_chain(filters, Box::new(Discard));
    run(source, consumer).await.context("run search")
}

/// Terminal sink for `search`: `Search` itself does the reporting (via
/// tracing events), so the chain just needs somewhere to drop elements.
struct Discard;

#[async_trait]
impl Consumer for Discard {
    async fn accept(&mut self, _element: Element) -> Result<()> {
        Ok(())
    }

    async fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}

async fn build_source(uri: Uri, global: &Global) -> Result<Box<dyn Source>> {
    match uri {
        Uri::Registry {
            username,
            password,
            host,
            port,
            repo,
            tag,
            query,
        } => {
            let host = match port {
                Some(port) => format!("{host}:{port}"),
                None => host,
            };
            let (namespace, name) = split_repo(&repo)?;
            let reference = Reference::builder()
                .host(host)
                .namespace(namespace)
                .name(name)
                .tag(&tag)
                .build();
            let auth = resolve_auth(username, password, global, &reference).await?;
            let insecure = query_flag(&query, "insecure") || global.insecure;
            let max_workers = query_usize(&query, "max_workers")?.unwrap_or(global.parallel);
            let platform = resolve_platform(&query, global)?;

            source::Registry::builder()
                .reference(reference)
                .auth(auth)
                .maybe_platform(platform)
                .max_workers(max_workers)
                .insecure(insecure)
                .build()
                .await
                .map(|registry| Box::new(registry) as Box<dyn Source>)
        }
        Uri::Docker { repo, tag, query } => {
            apply_docker_socket(&query);
            source::Daemon::builder()
                .reference(format!("{repo}:{tag}"))
                .build()
                .await
                .map(|daemon| Box::new(daemon) as Box<dyn Source>)
        }
        Uri::Tar { path } => source::Tarball::builder()
            .path(path)
            .build()
            .await
            .map(|tarball| Box::new(tarball) as Box<dyn Source>),
        Uri::Dir { .. } | Uri::Oci { .. } | Uri::Mounts { .. } => {
            Err(UriParseError::new("directory, OCI-bundle, and mounts layouts are write-only destinations").into())
        }
    }
}

async fn build_sink(uri: Uri, global: &Global) -> Result<Box<dyn Consumer>> {
    match uri {
        Uri::Registry {
            username,
            password,
            host,
            port,
            repo,
            tag,
            query,
        } => {
            let host = match port {
                Some(port) => format!("{host}:{port}"),
                None => host,
            };
            let (namespace, name) = split_repo(&repo)?;
            let reference = Reference::builder()
                .host(host)
                .namespace(namespace)
                .name(name)
                .tag(&tag)
                .build();
            let auth = resolve_auth(username, password, global, &reference).await?;
            let insecure = query_flag(&query, "insecure") || global.insecure;
            let max_workers = query_usize(&query, "max_workers")?.unwrap_or(global.parallel);
            let compression = match query.get("compression") {
                Some(value) => Compression::from_str(value).context("parse compression query param")?,
                None => global.compression,
            };

            sink::Registry::builder()
                .reference(reference)
                .auth(auth)
                .compression(compression)
                .max_workers(max_workers)
                .insecure(insecure)
                .build()
                .await
                .map(|registry| Box::new(registry) as Box<dyn Consumer>)
        }
        Uri::Docker { repo, tag, query } => {
            apply_docker_socket(&query);
            sink::Daemon::builder()
                .repo_tags(vec![format!("{repo}:{tag}")])
                .build()
                .await
                .map(|daemon| Box::new(daemon) as Box<dyn Consumer>)
        }
        Uri::Tar { path } => sink::Tarball::builder()
            .output(path)
            .build()
            .await
            .map(|tarball| Box::new(tarball) as Box<dyn Consumer>),
        Uri::Dir { path, query } => {
            let unique_names = query_flag(&query, "unique_names");
            let expand = query_flag(&query, "expand");
            sink::Directory::builder()
                .output(path)
                .image("occystrap")
                .tag("latest")
                .unique_names(unique_names)
                .expand(expand)
                .build()
                .await
                .map(|directory| Box::new(directory) as Box<dyn Consumer>)
        }
        Uri::Oci { path } => sink::OciBundle::builder()
            .output(path)
            .build()
            .await
            .map(|bundle| Box::new(bundle) as Box<dyn Consumer>),
        Uri::Mounts { path } => sink::Mounts::builder()
            .output(path)
            .build()
            .await
            .map(|mounts| Box::new(mounts) as Box<dyn Consumer>),
    }
}

/// `docker://` URIs may carry `?socket=/path/to/docker.sock`; bollard honors
/// `DOCKER_HOST` for a non-default socket, so that's what we set rather than
/// threading a socket override through every daemon source/sink.
fn apply_docker_socket(query: &std::collections::HashMap<String, String>) {
    if let Some(socket) = query.get("socket") {
        std::env::set_var("DOCKER_HOST", format!("unix://{socket}"));
    }
}

fn split_repo(repo: &str) -> Result<(String, String)> {
    match repo.rsplit_once('/') {
        Some((namespace, name)) => Ok((namespace.to_string(), name.to_string())),
        None => Err(UriParseError::new(format!("repository path must include a namespace: {repo}")).into()),
    }
}

async fn resolve_auth(
    uri_username: Option<String>,
    uri_password: Option<String>,
    global: &Global,
    reference: &Reference,
) -> Result<Authentication> {
    if let (Some(username), Some(password)) = (uri_username, uri_password) {
        return Ok(Authentication::basic(username, password));
    }
    if let (Some(username), Some(password)) = (&global.username, &global.password) {
        return Ok(Authentication::basic(username, password));
    }
    Authentication::docker(reference).await
}

/// Resolves the platform to select from a multi-platform image: a `?os=`/
/// `?arch=`/`?variant=` query parameter on the source URI overrides the
/// matching `--os`/`--architecture`/`--variant` global flag.
fn resolve_platform(query: &std::collections::HashMap<String, String>, global: &Global) -> Result<Option<Platform>> {
    let os = query.get("os").cloned().or_else(|| global.os.clone());
    let architecture = query.get("arch").cloned().or_else(|| global.architecture.clone());
    let variant = query.get("variant").cloned().or_else(|| global.variant.clone());

    match (os, architecture) {
        (Some(os), Some(architecture)) => Ok(Some(
            Platform::builder()
                .os(os)
                .architecture(architecture)
                .maybe_variant(variant)
                .build(),
        )),
        (None, None) => Ok(None),
        _ => bail!("os and architecture must be given together"),
    }
}

fn query_flag(query: &std::collections::HashMap<String, String>, key: &str) -> bool {
    query.get(key).map(|v| v == "true").unwrap_or(false)
}

fn query_usize(query: &std::collections::HashMap<String, String>, key: &str) -> Result<Option<usize>> {
    query
        .get(key)
        .map(|v| v.parse::<usize>())
        .transpose()
        .with_context(|| format!("parse {key} query parameter"))
}

fn init_logging(verbose: u8, script_friendly: bool) {
    let default_level = if verbose > 0 { LevelFilter::DEBUG } else { LevelFilter::INFO };
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = if script_friendly {
        Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_target(false),
        )
    } else {
        Box::new(
            tracing_tree::HierarchicalLayer::default()
                .with_indent_lines(true)
                .with_indent_amount(2)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_verbose_exit(false)
                .with_verbose_entry(false)
                .with_deferred_spans(true)
                .with_bracketed_fields(true)
                .with_span_retrace(true)
                .with_targets(false),
        )
    };

    tracing_subscriber::registry()
        .with(tracing_error::ErrorLayer::default())
        .with(fmt_layer)
        .with(env_filter)
        .init();
}

fn style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Green.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
        .error(AnsiColor::Red.on_default())
        .invalid(AnsiColor::Red.on_default())
        .valid(AnsiColor::Blue.on_default())
}
