use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod};
use kdash_bus::{EventPublisher, InProcTransport, RetryPolicy, TcpTransport, Transport};
use kdash_core::{ResourceKind, ResourceRecord};
use kdash_kubehub::{ClusterRegistry, CredentialProvider, KubeconfigProvider, ResourceWatcher, WatcherConfig};
use kdash_persist::{sink, Repository, SqliteRepository};
use kdash_store::WatchedResource;
use tokio::signal;
use tracing::{info, warn};

mod agent;

use agent::{AgentConfig, Registry};

#[derive(Parser, Debug)]
#[command(name = "kdashctl", version, about = "kdash: multi-cluster Kubernetes dashboard core")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubeconfig whose contexts are the clusters
    #[arg(long, global = true, env = "KDASH_KUBECONFIG")]
    kubeconfig: Option<String>,

    /// Namespace filter; empty or "all" means every namespace
    #[arg(long = "ns", global = true, env = "KDASH_NAMESPACE")]
    namespace: Option<String>,

    /// Kinds to watch
    #[arg(long, global = true, env = "KDASH_KINDS", value_delimiter = ',', default_value = "namespace,pod,configmap")]
    kinds: Vec<ResourceKind>,

    /// Seconds a watcher may take to complete its initial sync
    #[arg(long = "sync-timeout-secs", global = true, env = "KDASH_SYNC_TIMEOUT_SECS", default_value_t = 30)]
    sync_timeout_secs: u64,

    /// SQLite database path (default ~/.kdash/kdash.db)
    #[arg(long = "db", global = true, env = "KDASH_DB_PATH")]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List clusters (kubeconfig contexts)
    Clusters,
    /// Probe every cluster
    Health,
    /// Watch clusters and publish changes to a sink
    Agent {
        #[arg(long = "publish-addr", env = "KDASH_PUBLISH_ADDR", default_value = "127.0.0.1:50053")]
        publish_addr: String,
    },
    /// Receive changes from agents and persist them
    Sink {
        #[arg(long = "listen-addr", env = "KDASH_LISTEN_ADDR", default_value = "127.0.0.1:50053")]
        listen_addr: String,
    },
    /// Agent and sink in one process over the in-process transport
    Standalone,
    /// List stored resources of one kind
    Ls {
        kind: ResourceKind,
        #[arg(long)]
        cluster: String,
        /// Read from a live watcher instead of the repository
        #[arg(long)]
        live: bool,
    },
    /// Show one stored resource
    Get {
        kind: ResourceKind,
        name: String,
        #[arg(long)]
        cluster: String,
    },
    /// Delete every stored record of a cluster
    Purge {
        #[arg(long)]
        cluster: String,
    },
}

fn init_tracing() {
    let env = std::env::var("KDASH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KDASH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KDASH_METRICS_ADDR; expected host:port");
        }
    }
}

impl Cli {
    fn provider(&self) -> Result<KubeconfigProvider> {
        match &self.kubeconfig {
            Some(p) => Ok(KubeconfigProvider::new(p)),
            None => KubeconfigProvider::from_env().context("locating kubeconfig"),
        }
    }

    async fn registry(&self) -> Result<Arc<Registry>> {
        let registry = Arc::new(ClusterRegistry::new(self.provider()?));
        let added = registry.discover_and_register().await.context("discovering clusters")?;
        info!(clusters = added.len(), "clusters registered");
        Ok(registry)
    }

    fn repository(&self) -> Result<SqliteRepository> {
        let repo = match &self.db_path {
            Some(p) => SqliteRepository::open(p),
            None => SqliteRepository::open_default(),
        };
        repo.context("opening repository")
    }

    fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            kinds: self.kinds.clone(),
            watcher: WatcherConfig {
                sync_timeout: Duration::from_secs(self.sync_timeout_secs),
                namespace: self.namespace.clone(),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Clusters => {
            let registry = cli.registry().await?;
            let infos = registry.cluster_infos();
            let descriptors = registry.provider().discover_clusters().await?;
            match cli.output {
                Output::Human => {
                    println!("{:<32} {:<14} API", "CLUSTER", "STATUS");
                    for d in &descriptors {
                        let status = infos.iter().find(|i| i.id == d.id).map(|i| i.status);
                        println!(
                            "{:<32} {:<14} {}",
                            d.id,
                            status.map(|s| format!("{:?}", s).to_lowercase()).unwrap_or_default(),
                            d.api_url.as_deref().unwrap_or("-")
                        );
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&descriptors)?),
            }
        }
        Commands::Health => {
            let registry = cli.registry().await?;
            for id in registry.list_clusters() {
                if let Err(e) = registry.get_connection(&id).await {
                    warn!(cluster = %id, error = %e, "authentication failed");
                }
            }
            let health = registry.check_health().await;
            match cli.output {
                Output::Human => {
                    for (id, ok) in &health {
                        println!("{:<32} {}", id, if *ok { "healthy" } else { "unhealthy" });
                    }
                }
                Output::Json => {
                    let map: serde_json::Map<String, serde_json::Value> =
                        health.into_iter().map(|(id, ok)| (id, serde_json::Value::Bool(ok))).collect();
                    println!("{}", serde_json::to_string_pretty(&map)?);
                }
            }
        }
        Commands::Agent { publish_addr } => {
            let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new(publish_addr.clone(), publish_addr.clone()));
            if let Err(e) = transport.connect().await {
                warn!(addr = %publish_addr, error = %e, "sink not reachable yet; will reconnect on publish");
            }
            let registry = cli.registry().await?;
            run_agent(&cli, registry, transport).await?;
        }
        Commands::Sink { listen_addr } => {
            let transport = TcpTransport::new(listen_addr.clone(), listen_addr.clone());
            let repo: Arc<dyn Repository> = Arc::new(cli.repository()?);
            let registry = Arc::new(ClusterRegistry::new(cli.provider()?));
            attach_sink(&transport, &repo, &registry, &cli.kinds);
            transport.listen().await.context("starting listener")?;
            info!(addr = ?transport.local_addr(), "sink ready");
            signal::ctrl_c().await?;
            info!("Ctrl-C received; shutting down sink");
            transport.close().await?;
            registry.stop_all();
            repo.close()?;
        }
        Commands::Standalone => {
            let transport = Arc::new(InProcTransport::new());
            let repo: Arc<dyn Repository> = Arc::new(cli.repository()?);
            let registry = cli.registry().await?;
            attach_sink(&*transport, &repo, &registry, &cli.kinds);
            run_agent(&cli, registry, transport).await?;
            repo.close()?;
        }
        Commands::Ls { kind, cluster, live } => {
            let items: Vec<serde_json::Value> = if *live {
                let registry = cli.registry().await?;
                let ns = cli.namespace.as_deref();
                let items = match kind {
                    ResourceKind::Namespace => live_list::<Namespace>(&cli, &registry, cluster, ns).await?,
                    ResourceKind::Pod => live_list::<Pod>(&cli, &registry, cluster, ns).await?,
                    ResourceKind::ConfigMap => live_list::<ConfigMap>(&cli, &registry, cluster, ns).await?,
                };
                registry.stop_all();
                items
            } else {
                let repo = cli.repository()?;
                let mut records = repo.list(cluster, cli.namespace.as_deref(), kind.kind_name())?;
                records.sort_by(|a, b| a.id.cmp(&b.id));
                records.into_iter().map(|r| r.resource).collect()
            };
            match cli.output {
                Output::Human => {
                    println!("{:<20} {:<40} AGE", "NAMESPACE", "NAME");
                    for v in &items {
                        let meta = &v["metadata"];
                        println!(
                            "{:<20} {:<40} {}",
                            meta["namespace"].as_str().unwrap_or("-"),
                            meta["name"].as_str().unwrap_or(""),
                            render_age(meta["creationTimestamp"].as_str())
                        );
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&items)?),
            }
        }
        Commands::Get { kind, name, cluster } => {
            let repo = cli.repository()?;
            let record = fetch_record(&repo, cluster, cli.namespace.as_deref(), *kind, name)?;
            print_record(cli.output, &record)?;
        }
        Commands::Purge { cluster } => {
            let repo = cli.repository()?;
            let removed = sink::purge_cluster(&repo, cluster)?;
            println!("removed {} records of cluster {}", removed, cluster);
        }
    }
    Ok(())
}

fn fetch_record(
    repo: &dyn Repository,
    cluster: &str,
    namespace: Option<&str>,
    kind: ResourceKind,
    name: &str,
) -> Result<ResourceRecord> {
    repo.get(cluster, namespace, kind.kind_name(), name)
        .with_context(|| format!("getting {} {} in cluster {}", kind.kind_name(), name, cluster))
}

fn attach_sink(transport: &dyn Transport, repo: &Arc<dyn Repository>, registry: &Arc<Registry>, kinds: &[ResourceKind]) {
    sink::attach(transport, Arc::clone(repo), kinds);
    let registry = Arc::clone(registry);
    sink::attach_announcements(transport, move |a| {
        if registry.register(&a.cluster_name) {
            info!(cluster = %a.cluster_name, api_url = %a.api_url, "cluster announced by agent");
        }
        Ok(())
    });
}

async fn run_agent(cli: &Cli, registry: Arc<Registry>, transport: Arc<dyn Transport>) -> Result<()> {
    let publisher = EventPublisher::spawn(Arc::clone(&transport), RetryPolicy::default());
    let (watchers, started) = agent::start_watchers(&registry, &publisher, &cli.agent_config()).await;
    if let Err(e) = started {
        warn!(error = %e, "some clusters failed to start");
    }
    info!(watchers = watchers.len(), "agent running; Ctrl-C to stop");
    signal::ctrl_c().await?;
    info!("Ctrl-C received; shutting down agent");
    registry.stop_all();
    drop(watchers);
    publisher.shutdown().await;
    transport.close().await?;
    Ok(())
}

async fn live_list<K: WatchedResource>(
    cli: &Cli,
    registry: &Registry,
    cluster: &str,
    namespace: Option<&str>,
) -> Result<Vec<serde_json::Value>> {
    let creds = registry.credentials(cluster).await?;
    let conn = registry.get_connection(cluster).await?;
    let mut watcher = ResourceWatcher::<K>::for_connection(&conn, cli.agent_config().watcher);
    watcher.start(creds.client.clone()).await.with_context(|| format!("watching {} on {}", K::KIND, cluster))?;
    let items = watcher.list(namespace)?;
    watcher.stop();
    items.iter().map(|o| serde_json::to_value(o).context("encoding object")).collect()
}

fn print_record(output: Output, record: &ResourceRecord) -> Result<()> {
    match output {
        Output::Human => {
            println!("id:          {}", record.id);
            println!("uid:         {}", record.uid);
            println!("version:     {}", record.resource_version);
            println!("created:     {}", record.created_at.to_rfc3339());
            println!("updated:     {}", record.updated_at.to_rfc3339());
            println!("{}", serde_json::to_string_pretty(&record.resource)?);
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(record)?),
    }
    Ok(())
}

fn render_age(creation_ts: Option<&str>) -> String {
    let Some(ts) = creation_ts.and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok()) else {
        return "-".to_string();
    };
    let mut secs = (chrono::Utc::now().timestamp() - ts.timestamp()).max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}
