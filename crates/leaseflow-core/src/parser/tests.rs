use super::*;
use crate::model::{GIB, Protocol, ServiceKind};

const VALID: &str = r#"
version: "v1"
name: inference
services:
  - name: api
    type: container
    image: ghcr.io/acme/api
    tag: "1.4.0"
    resources: { cpu: 500, memory: 268435456 }
    ports:
      - { name: http, containerPort: 8080, expose: true }
      - { name: dns, containerPort: 53, protocol: udp }
    volumes:
      - { name: cache, mountPath: /var/cache }
volumes:
  - { name: cache, type: persistent, size: 10737418240 }
"#;

#[test]
fn test_parse_valid_manifest() {
    let manifest = parse_str(VALID).unwrap();
    validate(&manifest).unwrap();

    assert_eq!(manifest.version, "v1");
    assert_eq!(manifest.name, "inference");
    assert_eq!(manifest.services.len(), 1);

    let api = &manifest.services[0];
    assert_eq!(api.kind, ServiceKind::Container);
    assert_eq!(api.tag.as_deref(), Some("1.4.0"));
    assert_eq!(api.resources.cpu, 500);
    assert_eq!(api.resources.gpu, 0);
    assert_eq!(api.ports.len(), 2);
    assert!(api.ports[0].expose);
    assert!(!api.ports[1].expose);
    assert_eq!(api.ports[1].protocol, Protocol::Udp);
    assert_eq!(api.volumes[0].mount_path, "/var/cache");

    assert_eq!(manifest.volumes[0].size, 10 * GIB);
    assert_eq!(manifest.volumes[0].size_gib(), 10);
}

#[test]
fn test_parse_rejects_unknown_version() {
    let yaml = VALID.replace("version: \"v1\"", "version: \"v2\"");
    let result = parse_str(&yaml);
    assert!(matches!(result, Err(ManifestError::UnsupportedVersion(v)) if v == "v2"));
}

#[test]
fn test_parse_rejects_malformed_yaml() {
    let result = parse_str("version: v1\nservices: [");
    assert!(matches!(result, Err(ManifestError::Parse(_))));
}

#[test]
fn test_parse_rejects_unknown_service_type() {
    let yaml = VALID.replace("type: container", "type: lambda");
    assert!(matches!(parse_str(&yaml), Err(ManifestError::Parse(_))));
}

#[test]
fn test_validate_undeclared_volume() {
    let yaml = VALID.replace("{ name: cache, mountPath", "{ name: scratch, mountPath");
    let manifest = parse_str(&yaml).unwrap();

    match validate(&manifest) {
        Err(ManifestError::UndeclaredVolume { service, volume }) => {
            assert_eq!(service, "api");
            assert_eq!(volume, "scratch");
        }
        other => panic!("expected UndeclaredVolume, got {:?}", other),
    }
}

#[test]
fn test_validate_non_positive_cpu() {
    let yaml = VALID.replace("cpu: 500", "cpu: 0");
    let manifest = parse_str(&yaml).unwrap();
    assert!(matches!(
        validate(&manifest),
        Err(ManifestError::InvalidResources { .. })
    ));
}

#[test]
fn test_validate_non_positive_memory() {
    let yaml = VALID.replace("memory: 268435456", "memory: -1");
    let manifest = parse_str(&yaml).unwrap();
    assert!(matches!(
        validate(&manifest),
        Err(ManifestError::InvalidResources { .. })
    ));
}

#[test]
fn test_validate_negative_gpu() {
    let yaml = VALID.replace("memory: 268435456", "memory: 268435456, gpu: -1");
    let manifest = parse_str(&yaml).unwrap();
    assert!(matches!(
        validate(&manifest),
        Err(ManifestError::InvalidResources { .. })
    ));
}

#[test]
fn test_validate_rejects_oversized_requests() {
    for (from, to) in [
        ("cpu: 500", "cpu: 9223372036854775807"),
        ("cpu: 500", "cpu: 1024001"),
        ("memory: 268435456", "memory: 70368744177665"),
        ("memory: 268435456", "memory: 268435456, gpu: 65"),
    ] {
        let yaml = VALID.replace(from, to);
        let manifest = parse_str(&yaml).unwrap();
        assert!(
            matches!(
                validate(&manifest),
                Err(ManifestError::InvalidResources { .. })
            ),
            "{}",
            to
        );
    }

    let yaml = VALID.replace("size: 10737418240", "size: 9223372036854775807");
    let manifest = parse_str(&yaml).unwrap();
    assert!(matches!(
        validate(&manifest),
        Err(ManifestError::InvalidVolume { .. })
    ));
}

#[test]
fn test_validate_accepts_largest_requests() {
    let yaml = VALID
        .replace("cpu: 500", "cpu: 1024000")
        .replace("memory: 268435456", "memory: 70368744177664, gpu: 64");
    let manifest = parse_str(&yaml).unwrap();
    validate(&manifest).unwrap();

    let total = manifest.total_resources();
    assert_eq!(total.vcpus(), 1024);
    assert_eq!(total.memory_mib(), 64 * 1024 * 1024);
}

#[test]
fn test_validate_zero_gpu_is_allowed() {
    let yaml = VALID.replace("memory: 268435456", "memory: 268435456, gpu: 0");
    let manifest = parse_str(&yaml).unwrap();
    assert!(validate(&manifest).is_ok());
}

#[test]
fn test_validate_duplicate_service() {
    let yaml = r#"
version: "v1"
name: dup
services:
  - { name: a, type: vm, image: ubuntu, resources: { cpu: 1000, memory: 1073741824 } }
  - { name: a, type: vm, image: ubuntu, resources: { cpu: 1000, memory: 1073741824 } }
"#;
    let manifest = parse_str(yaml).unwrap();
    assert!(matches!(
        validate(&manifest),
        Err(ManifestError::DuplicateService(name)) if name == "a"
    ));
}

#[test]
fn test_validate_empty_services() {
    let manifest = parse_str("version: v1\nname: empty\nservices: []\n").unwrap();
    assert!(matches!(validate(&manifest), Err(ManifestError::NoServices)));
}

#[test]
fn test_validate_zero_port() {
    let yaml = VALID.replace("containerPort: 8080", "containerPort: 0");
    let manifest = parse_str(&yaml).unwrap();
    assert!(matches!(
        validate(&manifest),
        Err(ManifestError::InvalidPort { .. })
    ));
}

#[test]
fn test_validate_zero_sized_volume() {
    let yaml = VALID.replace("size: 10737418240", "size: 0");
    let manifest = parse_str(&yaml).unwrap();
    assert!(matches!(
        validate(&manifest),
        Err(ManifestError::InvalidVolume { .. })
    ));
}

#[test]
fn test_load_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("manifest.yaml");
    std::fs::write(&path, VALID).unwrap();

    let manifest = load_file(&path).unwrap();
    assert_eq!(manifest.name, "inference");
}

#[test]
fn test_load_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let result = load_file(dir.path().join("absent.yaml"));
    assert!(matches!(result, Err(ManifestError::Read { .. })));
}
