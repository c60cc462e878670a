//! Volume management.
//!
//! Volumes live as files inside a storage pool directory on the host, named
//! `<name>.<TYPE>`. Both supported types are backed by a dynamically
//! expanding virtual disk created through the driver.

use crate::driver::HypervisorDriver;
use crate::error::{Error, Result};
use crate::job::JobPoller;
use std::path::Path;
use vmshim_protocol::{CreateCommand, Volume};

/// Volume type for data disks.
pub const DATADISK: &str = "DATADISK";

/// Volume type for ISO images.
pub const ISO: &str = "ISO";

/// Path of a volume file inside a pool.
pub fn volume_path(pool_path: &str, name: &str, volume_type: &str) -> Result<String> {
    if volume_type != DATADISK && volume_type != ISO {
        return Err(Error::unsupported("volume type", volume_type));
    }
    let file = format!("{}.{}", name, volume_type);
    Ok(Path::new(pool_path).join(file).to_string_lossy().into_owned())
}

/// Create a volume described by `cmd`.
pub fn create_volume(
    driver: &mut dyn HypervisorDriver,
    poller: &JobPoller,
    cmd: &CreateCommand,
) -> Result<Volume> {
    let disk = &cmd.disk_characteristics;
    if disk.name.trim().is_empty() {
        return Err(Error::InvalidCommand("volume name is empty".to_string()));
    }
    let path = volume_path(&cmd.pool.path, &disk.name, &disk.volume_type)?;
    if disk.size == 0 {
        return Err(Error::InvalidCommand(format!(
            "volume {} has zero size",
            disk.name
        )));
    }

    let submission = driver.create_virtual_disk(&path, disk.size)?;
    poller
        .resolve(driver, submission)
        .map_err(|e| e.during(format!("create volume {}", path)))?;

    tracing::info!(
        volume = %disk.name,
        path = %path,
        size = disk.size,
        volume_type = %disk.volume_type,
        "created volume"
    );

    Ok(Volume {
        id: cmd.vol_id,
        name: disk.name.clone(),
        size: disk.size,
        volume_type: disk.volume_type.clone(),
        path,
        mount_point: cmd.pool.path.clone(),
    })
}

/// Delete a volume's backing file.
pub fn destroy_volume(driver: &mut dyn HypervisorDriver, volume: &Volume) -> Result<()> {
    driver
        .delete_file(&volume.path)
        .map_err(|e| e.during(format!("destroy volume {}", volume.name)))?;
    tracing::info!(volume = %volume.name, path = %volume.path, "destroyed volume");
    Ok(())
}
