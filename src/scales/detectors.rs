//! Scale family identification from advertisement data
//!
//! Sessions are normally configured with an explicit family. Identification is only
//! needed when a caller wants to pre-select one from a scan result.

use crate::scales::traits::ScaleFamily;
use log::debug;

impl ScaleFamily {
    /// Family whose advertised-name prefixes match `name`, if any.
    pub fn from_advertised_name(name: &str) -> Option<ScaleFamily> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let family = ScaleFamily::ALL
            .into_iter()
            .find(|family| family.variant().matches_name(name));

        if let Some(family) = family {
            debug!("🎯 {} scale detected by name: {}", family, name);
        }
        family
    }

    /// Family advertising `service` as its primary GATT service.
    pub fn from_service_uuid(service: &uuid::Uuid) -> Option<ScaleFamily> {
        ScaleFamily::ALL
            .into_iter()
            .find(|family| family.variant().service_uuid == *service)
    }
}
