mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "leaseflow")]
#[command(about = "リースされたワークロードを、どのバックエンドでも同じ手順で。", long_about = None)]
struct Cli {
    /// デバッグログを出力
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// マニフェストを検証
    Validate {
        /// マニフェストファイル (YAML)
        manifest: PathBuf,
        /// 指定バックエンドで展開できるかも確認 (aws, azure, vmware, k8s)
        #[arg(short, long)]
        backend: Option<String>,
    },
    /// 実効設定を表示
    Config {
        /// 設定ファイルのパスだけを表示
        #[arg(long)]
        path: bool,
    },
    /// バージョン情報を表示
    Version,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ログは stderr、RUST_LOG があればそちらを優先
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Validate { manifest, backend } => {
            commands::validate::handle(&manifest, backend.as_deref())?;
        }
        Commands::Config { path } => {
            commands::config::handle(path)?;
        }
        Commands::Version => {
            println!("leaseflow {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
