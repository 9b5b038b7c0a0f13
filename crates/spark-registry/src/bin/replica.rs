//! `spark-registry-replica`：可独立运行的注册表副本节点。
//!
//! 启动流程：加载 TOML 配置 → 初始化日志 → 绑定转发接收端 → 为每个对端建立转发器 →
//! 以 `ClusterMember` 注册自身 → 订阅并记录成员变更 → Ctrl-C 后注销并关闭接收端。

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use spark_registry::observability::init_tracing;
use spark_registry::{
    Attributes, ClusterMember, NodeUpdate, ReplicaConfig, ReplicaForwarder, ReplicaListener,
    Result, StateMap,
};

#[derive(Debug, Parser)]
#[command(name = "spark-registry-replica", version, about = "Run a spark-registry replica node")]
struct Cli {
    /// Path to the replica TOML configuration.
    #[arg(short, long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match ReplicaConfig::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load {}: {err}", cli.config.display());
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config.log_filter);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(code = err.code(), error = %err, "replica terminated");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ReplicaConfig) -> Result<()> {
    let forwarders = config
        .peers
        .iter()
        .map(|peer| {
            ReplicaForwarder::connect(
                peer.clone(),
                config.node_id.clone(),
                config.forwarder.clone(),
            )
        })
        .collect::<Result<Vec<_>>>()?;

    let member = ClusterMember::register(
        Attributes {
            id: config.node_id.clone(),
            service: config.service.clone(),
            locality: config.locality.clone(),
            revision: config.revision.clone(),
        },
        StateMap::from([("addr.replica".to_owned(), config.listen.clone())]),
        forwarders,
    )?;
    let listener = ReplicaListener::bind_with_limit(
        &config.listen,
        member.node_map().clone(),
        config.max_frame_bytes,
    )
    .await?;

    let membership = member.subscribe(true, |update: &NodeUpdate| {
        tracing::info!(
            member_id = %update.node_id,
            update_type = ?update.update_type,
            "membership changed"
        );
    });

    tracing::info!(
        node_id = %config.node_id,
        listen = %listener.local_addr(),
        peers = config.peers.len(),
        "replica started"
    );
    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down replica");
    membership.unsubscribe();
    member.unregister().await;
    listener.close().await;
    Ok(())
}
