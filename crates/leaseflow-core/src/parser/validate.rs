use super::check_version;
use crate::error::{ManifestError, Result};
use crate::model::{
    MAX_CPU_MILLICORES, MAX_GPUS, MAX_MEMORY_BYTES, MAX_VOLUME_BYTES, Manifest, ServiceSpec,
    VolumeSpec,
};
use std::collections::HashSet;

/// Validate a parsed manifest
///
/// Checks run in document order and the first violation is returned.
pub fn validate(manifest: &Manifest) -> Result<()> {
    check_version(&manifest.version)?;

    if manifest.name.trim().is_empty() {
        return Err(ManifestError::MissingName);
    }
    if manifest.services.is_empty() {
        return Err(ManifestError::NoServices);
    }

    let mut volume_names = HashSet::new();
    for volume in &manifest.volumes {
        validate_volume(volume)?;
        if !volume_names.insert(volume.name.as_str()) {
            return Err(ManifestError::DuplicateVolume(volume.name.clone()));
        }
    }

    let mut service_names = HashSet::new();
    for service in &manifest.services {
        validate_service(service, &volume_names)?;
        if !service_names.insert(service.name.as_str()) {
            return Err(ManifestError::DuplicateService(service.name.clone()));
        }
    }

    Ok(())
}

fn validate_volume(volume: &VolumeSpec) -> Result<()> {
    if volume.name.trim().is_empty() {
        return Err(ManifestError::InvalidVolume {
            volume: volume.name.clone(),
            reason: "name must not be empty".to_string(),
        });
    }
    if volume.size <= 0 {
        return Err(ManifestError::InvalidVolume {
            volume: volume.name.clone(),
            reason: format!("size must be positive, got {}", volume.size),
        });
    }
    if volume.size > MAX_VOLUME_BYTES {
        return Err(ManifestError::InvalidVolume {
            volume: volume.name.clone(),
            reason: format!("size must be at most {}, got {}", MAX_VOLUME_BYTES, volume.size),
        });
    }
    Ok(())
}

fn validate_service(service: &ServiceSpec, volumes: &HashSet<&str>) -> Result<()> {
    if service.name.trim().is_empty() {
        return Err(ManifestError::MissingServiceName);
    }
    if service.image.trim().is_empty() {
        return Err(ManifestError::MissingImage(service.name.clone()));
    }

    let resources = &service.resources;
    let reason = if resources.cpu <= 0 {
        Some(format!("cpu must be positive, got {}", resources.cpu))
    } else if resources.cpu > MAX_CPU_MILLICORES {
        Some(format!(
            "cpu must be at most {}m, got {}",
            MAX_CPU_MILLICORES, resources.cpu
        ))
    } else if resources.memory <= 0 {
        Some(format!("memory must be positive, got {}", resources.memory))
    } else if resources.memory > MAX_MEMORY_BYTES {
        Some(format!(
            "memory must be at most {} bytes, got {}",
            MAX_MEMORY_BYTES, resources.memory
        ))
    } else if resources.gpu < 0 {
        Some(format!("gpu must not be negative, got {}", resources.gpu))
    } else if resources.gpu > MAX_GPUS {
        Some(format!("gpu must be at most {}, got {}", MAX_GPUS, resources.gpu))
    } else {
        None
    };
    if let Some(reason) = reason {
        return Err(ManifestError::InvalidResources {
            service: service.name.clone(),
            reason,
        });
    }

    let mut port_numbers = HashSet::new();
    for port in &service.ports {
        if port.container_port == 0 {
            return Err(ManifestError::InvalidPort {
                service: service.name.clone(),
                port: port.name.clone(),
                reason: "containerPort must be between 1 and 65535".to_string(),
            });
        }
        if !port_numbers.insert((port.container_port, port.protocol)) {
            return Err(ManifestError::InvalidPort {
                service: service.name.clone(),
                port: port.name.clone(),
                reason: format!("containerPort {} declared twice", port.container_port),
            });
        }
    }

    for mount in &service.volumes {
        if !volumes.contains(mount.name.as_str()) {
            return Err(ManifestError::UndeclaredVolume {
                service: service.name.clone(),
                volume: mount.name.clone(),
            });
        }
    }

    Ok(())
}
