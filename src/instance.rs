//! Per-configuration driver instances
//!
//! The host identifies a data source by its uid and bumps `updated` whenever
//! the configuration changes. One driver (and so one connector and one
//! database) exists per uid; a newer `updated` replaces it.

use crate::driver::DuckDbDriver;
use crate::reader::connector::HostEnvironment;
use crate::settings::DataSourceInstanceSettings;
use crate::{DataSourceError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;

pub struct InstanceManager {
    env: HostEnvironment,
    instances: Mutex<HashMap<String, (i64, Arc<DuckDbDriver>)>>,
}

impl InstanceManager {
    pub fn new(env: HostEnvironment) -> Self {
        Self {
            env,
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn env(&self) -> &HostEnvironment {
        &self.env
    }

    /// Driver for `instance`, building it on first use or after a settings change
    ///
    /// A configuration error is returned without caching anything, so the
    /// next call with fixed settings builds a fresh driver.
    pub fn get(&self, instance: &DataSourceInstanceSettings) -> Result<Arc<DuckDbDriver>> {
        let mut instances = self.instances.lock().map_err(|e| {
            DataSourceError::InternalError(format!("Failed to lock instance map: {}", e))
        })?;

        if let Some((updated, driver)) = instances.get(&instance.uid) {
            if *updated == instance.updated {
                return Ok(Arc::clone(driver));
            }
            info!(
                "Settings of data source '{}' changed, replacing driver",
                instance.uid
            );
        }

        let driver = Arc::new(DuckDbDriver::new(instance, &self.env)?);
        instances.insert(instance.uid.clone(), (instance.updated, Arc::clone(&driver)));
        Ok(driver)
    }

    /// Drop the driver of `uid`; in-flight queries keep their handle
    pub fn dispose(&self, uid: &str) -> Result<bool> {
        let mut instances = self.instances.lock().map_err(|e| {
            DataSourceError::InternalError(format!("Failed to lock instance map: {}", e))
        })?;
        Ok(instances.remove(uid).is_some())
    }

    pub fn len(&self) -> usize {
        self.instances.lock().map(|i| i.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
