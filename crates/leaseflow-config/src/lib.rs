pub mod error;
pub mod settings;

pub use error::*;
pub use settings::*;

use config::{Config, Environment, File, FileFormat};
use std::path::{Path, PathBuf};

/// 設定ファイルパスを直接指定する環境変数
pub const CONFIG_PATH_ENV: &str = "LEASEFLOW_CONFIG_PATH";

/// 設定値を上書きする環境変数の接頭辞（例: `LEASEFLOW__AWS__REGION`）
pub const ENV_PREFIX: &str = "LEASEFLOW";

const CANDIDATES: [&str; 2] = ["leaseflow.local.yaml", "leaseflow.yaml"];

/// leaseflow のグローバル設定ディレクトリを取得
pub fn get_config_dir() -> Result<PathBuf> {
    Ok(dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("leaseflow"))
}

/// 設定ファイルを探す
///
/// 以下の優先順位で検索:
/// 1. 環境変数 LEASEFLOW_CONFIG_PATH (直接パス指定)
/// 2. カレントディレクトリ: leaseflow.local.yaml, leaseflow.yaml
/// 3. ./.leaseflow/ ディレクトリ内: 同様の順序
/// 4. ~/.config/leaseflow/leaseflow.yaml (グローバル設定)
///
/// 見つからなければ `None`（デフォルト値と環境変数だけで動く）
pub fn find_config_file() -> Result<Option<PathBuf>> {
    // 1. 環境変数で直接指定
    if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(Some(path));
        }
        tracing::warn!(path = %path.display(), "{} が存在しないファイルを指しています", CONFIG_PATH_ENV);
    }

    let current_dir = std::env::current_dir()?;

    // 2. カレントディレクトリ、3. ./.leaseflow/
    for dir in [current_dir.clone(), current_dir.join(".leaseflow")] {
        if let Some(path) = first_existing(&dir) {
            return Ok(Some(path));
        }
    }

    // 4. グローバル設定
    if let Ok(config_dir) = get_config_dir() {
        let global = config_dir.join("leaseflow.yaml");
        if global.exists() {
            return Ok(Some(global));
        }
    }

    Ok(None)
}

fn first_existing(dir: &Path) -> Option<PathBuf> {
    if !dir.is_dir() {
        return None;
    }
    CANDIDATES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.exists())
}

/// 設定を読み込む（デフォルト < 設定ファイル < 環境変数）
pub fn load() -> Result<Settings> {
    let path = find_config_file()?;
    load_from(path.as_deref())
}

/// 指定ファイルから設定を読み込む（ファイル無しも可）
pub fn load_from(path: Option<&Path>) -> Result<Settings> {
    let mut builder = Config::builder().add_source(Config::try_from(&Settings::default())?);

    if let Some(path) = path {
        tracing::debug!(path = %path.display(), "設定ファイルを読み込み");
        builder = builder.add_source(File::from(path).format(FileFormat::Yaml).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let settings: Settings = builder.build()?.try_deserialize()?;
    validate(&settings)?;
    Ok(settings)
}

/// 実効設定を YAML として出力
pub fn render(settings: &Settings) -> Result<String> {
    Ok(serde_yaml::to_string(settings)?)
}

/// 値の整合性チェック
pub fn validate(settings: &Settings) -> Result<()> {
    let reporting = &settings.reporting;
    if reporting.capacity == 0 {
        return Err(ConfigError::invalid("reporting.capacity", "0 より大きい必要があります"));
    }
    if reporting.usage_headroom >= reporting.capacity {
        return Err(ConfigError::invalid(
            "reporting.usage_headroom",
            format!("capacity ({}) 未満である必要があります", reporting.capacity),
        ));
    }
    if reporting.usage_interval_secs == 0 || reporting.reconcile_interval_secs == 0 {
        return Err(ConfigError::invalid("reporting", "間隔は 1 秒以上にしてください"));
    }

    for (field, retry) in [
        ("aws.retry", &settings.aws.retry),
        ("azure.retry", &settings.azure.retry),
        ("vsphere.retry", &settings.vsphere.retry),
        ("kubernetes.retry", &settings.kubernetes.retry),
    ] {
        if retry.max_attempts == 0 {
            return Err(ConfigError::invalid(field, "max_attempts は 1 以上"));
        }
        if retry.multiplier < 1.0 {
            return Err(ConfigError::invalid(field, "multiplier は 1.0 以上"));
        }
    }

    let prefix = &settings.kubernetes.namespace_prefix;
    if !prefix
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(ConfigError::invalid(
            "kubernetes.namespace_prefix",
            "英小文字・数字・'-' のみ使用できます",
        ));
    }

    Ok(())
}
