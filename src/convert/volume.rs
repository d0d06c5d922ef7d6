//! Service volumes to Swarm mounts

use super::{add_stack_label, Namespace};
use crate::compose::config::{is_external, ServiceVolumeConfig, VolumeConfig};
use crate::compose::syntax::mount_types;
use crate::error::{Result, StackError};
use crate::swarm::service::{
    BindOptions, ClusterOptions, Driver, Mount, TmpfsOptions, VolumeOptions,
};
use std::collections::BTreeMap;

/// Prefix selecting a cluster volume group instead of a named volume
const CLUSTER_GROUP_PREFIX: &str = "group:";

/// Convert every service volume into a mount
pub fn volumes(
    service_volumes: &[ServiceVolumeConfig],
    stack_volumes: &BTreeMap<String, VolumeConfig>,
    namespace: &Namespace,
) -> Result<Vec<Mount>> {
    service_volumes
        .iter()
        .map(|volume| convert_volume(volume, stack_volumes, namespace))
        .collect()
}

fn incompatible(option: &str, mount_type: &str) -> StackError {
    StackError::Validation(format!(
        "{} options are incompatible with type {}",
        option, mount_type
    ))
}

fn base_mount(volume: &ServiceVolumeConfig) -> Mount {
    Mount {
        mount_type: volume.volume_type.clone(),
        source: volume.source.clone().filter(|s| !s.is_empty()),
        target: volume.target.clone(),
        read_only: volume.read_only,
        consistency: volume.consistency.clone(),
        ..Default::default()
    }
}

fn bind_options(volume: &ServiceVolumeConfig) -> Option<BindOptions> {
    volume.bind.as_ref().map(|bind| BindOptions {
        propagation: bind.propagation.clone(),
        create_mountpoint: bind.create_host_path.unwrap_or(false),
    })
}

fn has_source(volume: &ServiceVolumeConfig) -> bool {
    volume.source.as_deref().is_some_and(|s| !s.is_empty())
}

fn convert_volume(
    volume: &ServiceVolumeConfig,
    stack_volumes: &BTreeMap<String, VolumeConfig>,
    namespace: &Namespace,
) -> Result<Mount> {
    match volume.volume_type.as_str() {
        mount_types::VOLUME | "" => volume_mount(volume, stack_volumes, namespace),
        mount_types::BIND => bind_mount(volume),
        mount_types::TMPFS => tmpfs_mount(volume),
        mount_types::NPIPE => npipe_mount(volume),
        mount_types::CLUSTER => cluster_mount(volume, stack_volumes, namespace),
        _ => Err(StackError::Validation(
            "volume type must be volume, bind, tmpfs, npipe, or cluster".to_string(),
        )),
    }
}

fn volume_mount(
    volume: &ServiceVolumeConfig,
    stack_volumes: &BTreeMap<String, VolumeConfig>,
    namespace: &Namespace,
) -> Result<Mount> {
    if volume.tmpfs.is_some() {
        return Err(incompatible("tmpfs", "volume"));
    }
    if volume.bind.is_some() {
        return Err(incompatible("bind", "volume"));
    }
    if volume.cluster.is_some() {
        return Err(incompatible("cluster", "volume"));
    }

    let mut mount = base_mount(volume);
    mount.mount_type = mount_types::VOLUME.to_string();
    let Some(source) = volume.source.as_deref().filter(|s| !s.is_empty()) else {
        // anonymous
        return Ok(mount);
    };

    let stack_volume = stack_volumes.get(source).ok_or_else(|| {
        StackError::Validation(format!("undefined volume {:?}", source))
    })?;
    mount.source = Some(namespace.resolve(source, stack_volume.name.as_deref()));

    let mut options = VolumeOptions {
        no_copy: volume.volume.as_ref().is_some_and(|v| v.nocopy),
        subpath: volume.volume.as_ref().and_then(|v| v.subpath.clone()),
        ..Default::default()
    };
    if !is_external(&stack_volume.external) {
        options.labels = add_stack_label(namespace, &stack_volume.labels);
        if stack_volume.driver.is_some() || !stack_volume.driver_opts.is_empty() {
            options.driver_config = Some(Driver {
                name: stack_volume.driver.clone().unwrap_or_default(),
                options: stack_volume.driver_opts.clone(),
            });
        }
    }
    mount.volume_options = Some(options);
    Ok(mount)
}

fn bind_mount(volume: &ServiceVolumeConfig) -> Result<Mount> {
    if !has_source(volume) {
        return Err(StackError::Validation(
            "invalid bind source, source cannot be empty".to_string(),
        ));
    }
    if volume.volume.is_some() {
        return Err(incompatible("volume", "bind"));
    }
    if volume.tmpfs.is_some() {
        return Err(incompatible("tmpfs", "bind"));
    }
    if volume.cluster.is_some() {
        return Err(incompatible("cluster", "bind"));
    }
    let mut mount = base_mount(volume);
    mount.bind_options = bind_options(volume);
    Ok(mount)
}

fn tmpfs_mount(volume: &ServiceVolumeConfig) -> Result<Mount> {
    if has_source(volume) {
        return Err(StackError::Validation(
            "invalid tmpfs source, source must be empty".to_string(),
        ));
    }
    if volume.bind.is_some() {
        return Err(incompatible("bind", "tmpfs"));
    }
    if volume.volume.is_some() {
        return Err(incompatible("volume", "tmpfs"));
    }
    if volume.cluster.is_some() {
        return Err(incompatible("cluster", "tmpfs"));
    }
    let mut mount = base_mount(volume);
    mount.tmpfs_options = volume.tmpfs.as_ref().map(|tmpfs| TmpfsOptions {
        size_bytes: tmpfs.size.map(|s| s.0),
        mode: tmpfs.mode,
    });
    Ok(mount)
}

fn npipe_mount(volume: &ServiceVolumeConfig) -> Result<Mount> {
    if !has_source(volume) {
        return Err(StackError::Validation(
            "invalid npipe source, source cannot be empty".to_string(),
        ));
    }
    if volume.volume.is_some() {
        return Err(incompatible("volume", "npipe"));
    }
    if volume.tmpfs.is_some() {
        return Err(incompatible("tmpfs", "npipe"));
    }
    let mut mount = base_mount(volume);
    mount.bind_options = bind_options(volume);
    Ok(mount)
}

fn cluster_mount(
    volume: &ServiceVolumeConfig,
    stack_volumes: &BTreeMap<String, VolumeConfig>,
    namespace: &Namespace,
) -> Result<Mount> {
    let Some(source) = volume.source.as_deref().filter(|s| !s.is_empty()) else {
        return Err(StackError::Validation(
            "invalid cluster source, source cannot be empty".to_string(),
        ));
    };
    if volume.tmpfs.is_some() {
        return Err(incompatible("tmpfs", "cluster"));
    }
    if volume.bind.is_some() {
        return Err(incompatible("bind", "cluster"));
    }
    if volume.volume.is_some() {
        return Err(incompatible("volume", "cluster"));
    }

    let mut mount = base_mount(volume);
    if !source.starts_with(CLUSTER_GROUP_PREFIX) {
        let stack_volume = stack_volumes.get(source).ok_or_else(|| {
            StackError::Validation(format!("undefined volume {:?}", source))
        })?;
        mount.source = Some(namespace.resolve(source, stack_volume.name.as_deref()));
    }
    mount.cluster_options = Some(ClusterOptions {});
    Ok(mount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::config::{ServiceBindOptions, ServiceTmpfsOptions, ByteSize};
    use crate::compose::syntax::parse_volume_spec;
    use crate::convert::LABEL_NAMESPACE;

    fn stack_volumes(yaml: &str) -> BTreeMap<String, VolumeConfig> {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_named_volume_scoped_with_labels_and_driver() {
        let vols = stack_volumes("data: {driver: local, driver_opts: {type: nfs}, labels: {a: b}}\n");
        let ns = Namespace::new("s");
        let mount = convert_volume(&parse_volume_spec("data:/var/lib:ro").unwrap(), &vols, &ns)
            .unwrap();
        assert_eq!(mount.mount_type, "volume");
        assert_eq!(mount.source.as_deref(), Some("s_data"));
        assert!(mount.read_only);
        let options = mount.volume_options.unwrap();
        assert_eq!(options.labels[LABEL_NAMESPACE], "s");
        assert_eq!(options.labels["a"], "b");
        assert_eq!(options.driver_config.unwrap().options["type"], "nfs");
    }

    #[test]
    fn test_external_volume_passes_name_through() {
        let vols = stack_volumes("data: {external: true, name: shared}\n");
        let mount = convert_volume(
            &parse_volume_spec("data:/d").unwrap(),
            &vols,
            &Namespace::new("s"),
        )
        .unwrap();
        assert_eq!(mount.source.as_deref(), Some("shared"));
        assert!(mount.volume_options.unwrap().labels.is_empty());
    }

    #[test]
    fn test_anonymous_and_undefined_volumes() {
        let ns = Namespace::new("s");
        let anon = convert_volume(&parse_volume_spec("/data").unwrap(), &BTreeMap::new(), &ns)
            .unwrap();
        assert_eq!(anon.source, None);
        assert!(anon.volume_options.is_none());

        let err = convert_volume(
            &parse_volume_spec("missing:/d").unwrap(),
            &BTreeMap::new(),
            &ns,
        )
        .unwrap_err();
        assert!(err.to_string().contains("undefined volume"));
    }

    #[test]
    fn test_bind_rules() {
        let ns = Namespace::new("s");
        let mount = convert_volume(
            &parse_volume_spec("/host:/ctr:rslave").unwrap(),
            &BTreeMap::new(),
            &ns,
        )
        .unwrap();
        assert_eq!(mount.bind_options.unwrap().propagation.as_deref(), Some("rslave"));

        let mut empty = ServiceVolumeConfig {
            volume_type: "bind".to_string(),
            target: "/x".to_string(),
            ..Default::default()
        };
        assert!(convert_volume(&empty, &BTreeMap::new(), &ns).is_err());
        empty.source = Some("/h".to_string());
        empty.tmpfs = Some(ServiceTmpfsOptions::default());
        assert!(convert_volume(&empty, &BTreeMap::new(), &ns).is_err());
    }

    #[test]
    fn test_tmpfs_rules() {
        let ns = Namespace::new("s");
        let mut tmpfs = ServiceVolumeConfig {
            volume_type: "tmpfs".to_string(),
            target: "/run".to_string(),
            tmpfs: Some(ServiceTmpfsOptions {
                size: Some(ByteSize(10_000)),
                mode: None,
            }),
            ..Default::default()
        };
        let mount = convert_volume(&tmpfs, &BTreeMap::new(), &ns).unwrap();
        assert_eq!(mount.tmpfs_options.unwrap().size_bytes, Some(10_000));

        tmpfs.source = Some("x".to_string());
        assert!(convert_volume(&tmpfs, &BTreeMap::new(), &ns).is_err());
        tmpfs.source = None;
        tmpfs.bind = Some(ServiceBindOptions::default());
        assert!(convert_volume(&tmpfs, &BTreeMap::new(), &ns).is_err());
    }

    #[test]
    fn test_cluster_group_bypasses_lookup() {
        let ns = Namespace::new("s");
        let group = ServiceVolumeConfig {
            volume_type: "cluster".to_string(),
            source: Some("group:db".to_string()),
            target: "/d".to_string(),
            ..Default::default()
        };
        let mount = convert_volume(&group, &BTreeMap::new(), &ns).unwrap();
        assert_eq!(mount.source.as_deref(), Some("group:db"));
        assert!(mount.cluster_options.is_some());

        let named = ServiceVolumeConfig {
            source: Some("vol".to_string()),
            ..group.clone()
        };
        let vols = stack_volumes("vol: {}\n");
        let mount = convert_volume(&named, &vols, &ns).unwrap();
        assert_eq!(mount.source.as_deref(), Some("s_vol"));
    }

    #[test]
    fn test_unknown_type() {
        let bad = ServiceVolumeConfig {
            volume_type: "weird".to_string(),
            target: "/x".to_string(),
            ..Default::default()
        };
        assert!(convert_volume(&bad, &BTreeMap::new(), &Namespace::new("s")).is_err());
    }
}
