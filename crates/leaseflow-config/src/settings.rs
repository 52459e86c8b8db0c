//! プロバイダー設定の型定義
//!
//! すべてのフィールドにデフォルト値があるため、設定ファイルも環境変数も
//! 無い状態でもローカル実行できる。

use leaseflow_cloud::{PollConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// leaseflow 全体の設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub provider: ProviderSettings,
    pub reporting: ReportingSettings,
    /// デプロイ失敗・キャンセル後のロールバックに許す時間（秒）
    pub teardown_timeout_secs: u64,
    pub aws: AwsSettings,
    pub azure: AzureSettings,
    pub vsphere: VsphereSettings,
    pub kubernetes: KubernetesSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider: ProviderSettings::default(),
            reporting: ReportingSettings::default(),
            teardown_timeout_secs: 600,
            aws: AwsSettings::default(),
            azure: AzureSettings::default(),
            vsphere: VsphereSettings::default(),
            kubernetes: KubernetesSettings::default(),
        }
    }
}

impl Settings {
    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_secs(self.teardown_timeout_secs)
    }
}

/// プロバイダーの識別情報
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub id: String,
    pub name: Option<String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            id: "local-provider".to_string(),
            name: None,
        }
    }
}

/// ステータス・使用量レポートチャネル
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportingSettings {
    /// チャネル容量
    pub capacity: usize,
    /// ステータス更新のために予約する空き枠。これ以下になると使用量サンプルは捨てる
    pub usage_headroom: usize,
    /// ステータス更新の送信待ち上限（ミリ秒）
    pub status_timeout_ms: u64,
    /// 使用量サンプリング間隔（秒）
    pub usage_interval_secs: u64,
    /// バックエンド状態の突き合わせ間隔（秒）
    pub reconcile_interval_secs: u64,
}

impl Default for ReportingSettings {
    fn default() -> Self {
        Self {
            capacity: 1024,
            usage_headroom: 128,
            status_timeout_ms: 5_000,
            usage_interval_secs: 60,
            reconcile_interval_secs: 30,
        }
    }
}

impl ReportingSettings {
    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }

    pub fn usage_interval(&self) -> Duration {
        Duration::from_secs(self.usage_interval_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

/// AWS (EC2) アダプター設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsSettings {
    pub region: String,
    pub availability_zone: Option<String>,
    /// 既存 VPC を使う場合に指定（未指定ならデプロイごとに作成）
    pub vpc_id: Option<String>,
    /// 既存サブネット（vpc_id と併用）
    pub subnet_id: Option<String>,
    pub vpc_cidr: String,
    pub subnet_cidr: String,
    /// リソース量からの自動選択を上書きするインスタンスタイプ
    pub instance_type: Option<String>,
    pub key_name: Option<String>,
    pub retry: RetryConfig,
    pub poll: PollConfig,
}

impl Default for AwsSettings {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            availability_zone: None,
            vpc_id: None,
            subnet_id: None,
            vpc_cidr: "10.0.0.0/16".to_string(),
            subnet_cidr: "10.0.1.0/24".to_string(),
            instance_type: None,
            key_name: None,
            // EC2 のリクエストレート制限に合わせて多めに
            retry: RetryConfig::new(5, 500),
            poll: PollConfig {
                interval_ms: 2_000,
                max_interval_ms: 15_000,
                max_polls: 90,
            },
        }
    }
}

/// Azure アダプター設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AzureSettings {
    pub location: String,
    /// 指定時はこのリソースグループを再利用し、削除しない
    pub resource_group: Option<String>,
    /// リソース量からの自動選択を上書きする VM サイズ
    pub vm_size: Option<String>,
    pub vnet_cidr: String,
    pub subnet_cidr: String,
    pub admin_username: String,
    pub retry: RetryConfig,
    pub poll: PollConfig,
}

impl Default for AzureSettings {
    fn default() -> Self {
        Self {
            location: "eastus".to_string(),
            resource_group: None,
            vm_size: None,
            vnet_cidr: "10.1.0.0/16".to_string(),
            subnet_cidr: "10.1.0.0/24".to_string(),
            admin_username: "leaseflow".to_string(),
            retry: RetryConfig::new(4, 1_000),
            poll: PollConfig::default(),
        }
    }
}

/// vSphere アダプター設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VsphereSettings {
    pub datacenter: String,
    pub cluster: String,
    pub datastore: String,
    pub network: String,
    pub folder: Option<String>,
    /// タスクハンドルのポーリング
    pub task_poll: PollConfig,
    pub retry: RetryConfig,
}

impl Default for VsphereSettings {
    fn default() -> Self {
        Self {
            datacenter: "Datacenter".to_string(),
            cluster: "Cluster".to_string(),
            datastore: "datastore1".to_string(),
            network: "VM Network".to_string(),
            folder: None,
            task_poll: PollConfig {
                interval_ms: 500,
                max_interval_ms: 5_000,
                max_polls: 360,
            },
            retry: RetryConfig::new(3, 1_000),
        }
    }
}

/// Kubernetes アダプター設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesSettings {
    /// デプロイごとの namespace 名の接頭辞
    pub namespace_prefix: String,
    pub storage_class: Option<String>,
    /// レプリカが揃うまでの待機
    pub rollout: PollConfig,
    /// namespace 削除完了の待機
    pub namespace_deletion: PollConfig,
    pub retry: RetryConfig,
}

impl Default for KubernetesSettings {
    fn default() -> Self {
        Self {
            namespace_prefix: "lf-".to_string(),
            storage_class: None,
            rollout: PollConfig {
                interval_ms: 1_000,
                max_interval_ms: 10_000,
                max_polls: 120,
            },
            namespace_deletion: PollConfig {
                interval_ms: 1_000,
                max_interval_ms: 10_000,
                max_polls: 120,
            },
            retry: RetryConfig::new(4, 250),
        }
    }
}
