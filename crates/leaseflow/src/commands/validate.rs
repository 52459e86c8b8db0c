use colored::Colorize;
use leaseflow_cloud::{BackendKind, DeploymentOptions};
use leaseflow_cloud_aws::AwsPlan;
use leaseflow_cloud_azure::AzurePlan;
use leaseflow_cloud_k8s::K8sPlan;
use leaseflow_cloud_vmware::VspherePlan;
use leaseflow_config::Settings;
use leaseflow_core::Manifest;
use std::path::Path;

pub fn handle(path: &Path, backend: Option<&str>) -> anyhow::Result<()> {
    println!("{}", "マニフェストを検証中...".blue());
    println!("ファイル: {}", path.display().to_string().cyan());

    // load_file はパースと検証を両方行う
    let manifest = match leaseflow_core::load_file(path) {
        Ok(manifest) => manifest,
        Err(e) => {
            eprintln!();
            eprintln!("{}", "✗ マニフェストエラー".red().bold());
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    };

    println!("{}", "✓ マニフェストは正常です！".green().bold());
    println!();
    print_summary(&manifest);

    let Some(backend) = backend else {
        return Ok(());
    };
    let Some(kind) = BackendKind::parse(backend) else {
        anyhow::bail!(
            "不明なバックエンド '{}' (aws, azure, vmware, k8s のいずれか)",
            backend
        );
    };

    // バックエンド既定値は設定から。設定が壊れていてもデフォルトで検証は続ける
    let settings = leaseflow_config::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "設定を読み込めないためデフォルト値を使います");
        Settings::default()
    });

    println!();
    match check_backend(&manifest, kind, &settings) {
        Ok(()) => {
            println!(
                "{}",
                format!("✓ {} で展開できます", kind).green().bold()
            );
        }
        Err(e) => {
            eprintln!("{}", format!("✗ {} では展開できません", kind).red().bold());
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn print_summary(manifest: &Manifest) {
    println!("サマリー:");
    println!("  名前: {}", manifest.name.cyan());
    println!("  サービス: {}個", manifest.services.len());
    for service in &manifest.services {
        println!(
            "    - {} ({}, {}, cpu {}, memory {})",
            service.name.cyan(),
            service.kind,
            service.image_ref(),
            service.resources.cpu_quantity(),
            service.resources.memory_quantity()
        );
        let exposed: Vec<String> = service
            .exposed_ports()
            .map(|p| format!("{}/{}", p.container_port, p.protocol.as_str()))
            .collect();
        if !exposed.is_empty() {
            println!("      公開ポート: {}", exposed.join(", "));
        }
    }
    if !manifest.volumes.is_empty() {
        println!("  ボリューム: {}個", manifest.volumes.len());
        for volume in &manifest.volumes {
            println!(
                "    - {} ({} GiB, 利用: {})",
                volume.name.cyan(),
                volume.size_gib(),
                manifest.volume_users(&volume.name).join(", ")
            );
        }
    }
}

/// バックエンド固有の制約を、実際の呼び出し無しで確認する
fn check_backend(
    manifest: &Manifest,
    kind: BackendKind,
    settings: &Settings,
) -> leaseflow_cloud::Result<()> {
    match kind {
        BackendKind::Aws => AwsPlan::build(manifest, &settings.aws).map(|_| ()),
        BackendKind::Azure => AzurePlan::build(manifest, &settings.azure).map(|_| ()),
        BackendKind::Vmware => VspherePlan::build(manifest, &settings.vsphere).map(|_| ()),
        BackendKind::Kubernetes => K8sPlan::build(
            manifest,
            &settings.kubernetes,
            "validate",
            "validate",
            &DeploymentOptions::default(),
        )
        .map(|_| ()),
    }
}
