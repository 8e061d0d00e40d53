//! LWM2M addressing and operation descriptors

use crate::error::{Lwm2mError, Result};
use std::fmt;
use std::str::FromStr;

/// Server-assigned device identifier
pub type DeviceId = u64;

/// Depth of a resource path
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Granularity {
    /// `/`
    Root,
    /// `/objectId`
    Object,
    /// `/objectId/instanceId`
    Instance,
    /// `/objectId/instanceId/resourceId`
    Resource,
}

/// Hierarchical LWM2M path: object, then instance, then resource
///
/// Constructors only allow consistent prefixes, so an instance id never
/// exists without its object id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ResourcePath {
    object_id: Option<u16>,
    instance_id: Option<u16>,
    resource_id: Option<u16>,
}

impl ResourcePath {
    /// The root path `/`
    pub fn root() -> Self {
        Self::default()
    }

    /// Type-level path `/objectId`
    pub fn object(object_id: u16) -> Self {
        Self {
            object_id: Some(object_id),
            ..Self::default()
        }
    }

    /// Instance-level path `/objectId/instanceId`
    pub fn instance(object_id: u16, instance_id: u16) -> Self {
        Self {
            object_id: Some(object_id),
            instance_id: Some(instance_id),
            resource_id: None,
        }
    }

    /// Resource-level path `/objectId/instanceId/resourceId`
    pub fn resource(object_id: u16, instance_id: u16, resource_id: u16) -> Self {
        Self {
            object_id: Some(object_id),
            instance_id: Some(instance_id),
            resource_id: Some(resource_id),
        }
    }

    pub fn object_id(&self) -> Option<u16> {
        self.object_id
    }

    pub fn instance_id(&self) -> Option<u16> {
        self.instance_id
    }

    pub fn resource_id(&self) -> Option<u16> {
        self.resource_id
    }

    /// How deep the path goes
    pub fn granularity(&self) -> Granularity {
        match (self.object_id, self.instance_id, self.resource_id) {
            (Some(_), Some(_), Some(_)) => Granularity::Resource,
            (Some(_), Some(_), None) => Granularity::Instance,
            (Some(_), None, _) => Granularity::Object,
            (None, _, _) => Granularity::Root,
        }
    }

    /// Uri-Path segments
    pub fn segments(&self) -> Vec<String> {
        [self.object_id, self.instance_id, self.resource_id]
            .into_iter()
            .map_while(|id| id.map(|id| id.to_string()))
            .collect()
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.segments().join("/"))
    }
}

impl FromStr for ResourcePath {
    type Err = Lwm2mError;

    fn from_str(s: &str) -> Result<Self> {
        let ids = s
            .split('/')
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<u16>()
                    .map_err(|_| Lwm2mError::InvalidPath(s.to_string()))
            })
            .collect::<Result<Vec<u16>>>()?;

        match ids.as_slice() {
            [] => Ok(Self::root()),
            [o] => Ok(Self::object(*o)),
            [o, i] => Ok(Self::instance(*o, *i)),
            [o, i, r] => Ok(Self::resource(*o, *i, *r)),
            _ => Err(Lwm2mError::InvalidPath(s.to_string())),
        }
    }
}

/// Kind of device operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Read,
    Write,
    Execute,
    WriteAttributes,
    Discover,
    Create,
    Observe,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Execute => "execute",
            Self::WriteAttributes => "writeAttribute",
            Self::Discover => "discover",
            Self::Create => "create",
            Self::Observe => "observe",
        };
        f.write_str(name)
    }
}

/// A device operation: what to do, on which device, at which path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operation {
    pub kind: OperationKind,
    pub device_id: DeviceId,
    pub path: ResourcePath,
}

impl Operation {
    pub fn new(kind: OperationKind, device_id: DeviceId, path: ResourcePath) -> Self {
        Self {
            kind,
            device_id,
            path,
        }
    }

    /// Human readable target used in error context, e.g. `device 3 /1/0/2`
    pub fn target(&self) -> String {
        format!("device {} {}", self.device_id, self.path)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' {} for device [{}]", self.kind, self.path, self.device_id)
    }
}

/// Key of an Observe subscription: `<deviceId>:/<objectId>/<instanceId>/<resourceId>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId {
    pub device_id: DeviceId,
    pub path: ResourcePath,
}

impl SubscriptionId {
    pub fn new(device_id: DeviceId, path: ResourcePath) -> Self {
        Self { device_id, path }
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device_id, self.path)
    }
}

impl FromStr for SubscriptionId {
    type Err = Lwm2mError;

    fn from_str(s: &str) -> Result<Self> {
        let (device, path) = s
            .split_once(':')
            .ok_or_else(|| Lwm2mError::InvalidPath(s.to_string()))?;
        let device_id = device
            .parse()
            .map_err(|_| Lwm2mError::InvalidPath(s.to_string()))?;
        Ok(Self {
            device_id,
            path: path.parse()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_granularity() {
        assert_eq!(ResourcePath::root().granularity(), Granularity::Root);
        assert_eq!(ResourcePath::object(3).granularity(), Granularity::Object);
        assert_eq!(ResourcePath::instance(3, 0).granularity(), Granularity::Instance);
        assert_eq!(ResourcePath::resource(3, 0, 1).granularity(), Granularity::Resource);
    }

    #[test]
    fn test_path_display_and_parse() {
        assert_eq!(ResourcePath::resource(3, 0, 13).to_string(), "/3/0/13");
        assert_eq!(ResourcePath::root().to_string(), "/");
        assert_eq!("/1/0".parse::<ResourcePath>().unwrap(), ResourcePath::instance(1, 0));
        assert!("/1/x".parse::<ResourcePath>().is_err());
        assert!("/1/2/3/4".parse::<ResourcePath>().is_err());
    }

    #[test]
    fn test_subscription_id() {
        let id = SubscriptionId::new(7, ResourcePath::resource(3303, 0, 5700));
        assert_eq!(id.to_string(), "7:/3303/0/5700");
        assert_eq!("7:/3303/0/5700".parse::<SubscriptionId>().unwrap(), id);
        assert!("nope".parse::<SubscriptionId>().is_err());
    }
}
