//! The built-in system feature: device/app identity and feature-support
//! queries, plus the outbound user-role query.

use log::*;
use std::sync::Weak;
use uuid::{uuid, Uuid};

use async_trait::async_trait;
use carlink_core::link::channel::{Query, ReceivedQuery, SecuredChannel};
use carlink_core::storage::Car;
use carlink_core::wire::de::each_field;
use carlink_core::wire::ser::{gen_field_bytes, gen_field_i32, to_vec};
use carlink_core::wire::ProtocolError;

use super::{Feature, FeatureHost, QueryResponder};
use crate::config::CompanionConfig;

/// Recipient UUID of the system feature
pub const SYSTEM_FEATURE_UUID: Uuid = uuid!("892ac5d9-e9a5-48dc-874a-c01b3cb7ddb8");

/// What a system query asks for. Field `1` of [`SystemQuery`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemQueryType {
    /// The phone's configured device name
    DeviceName,
    /// The companion app's name
    AppName,
    /// Which of the listed feature UUIDs have a registered feature
    IsFeatureSupported,
    /// The role of the user holding this phone
    UserRole,
}

impl SystemQueryType {
    fn tag(self) -> i32 {
        match self {
            SystemQueryType::DeviceName => 1,
            SystemQueryType::AppName => 2,
            SystemQueryType::IsFeatureSupported => 3,
            SystemQueryType::UserRole => 4,
        }
    }

    fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            1 => Some(SystemQueryType::DeviceName),
            2 => Some(SystemQueryType::AppName),
            3 => Some(SystemQueryType::IsFeatureSupported),
            4 => Some(SystemQueryType::UserRole),
            _ => None,
        }
    }
}

/// Request payload of a system query.
///
/// Fields: `1` type (enum), `2` repeated payloads (bytes; feature UUID
/// strings for [`SystemQueryType::IsFeatureSupported`]).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SystemQuery {
    /// Raw query-type tag; unknown values answer unsuccessfully
    pub query_type: i32,
    /// Type-specific payloads
    pub payloads: Vec<Vec<u8>>,
}

impl SystemQuery {
    /// Query with no payloads
    pub fn of(query_type: SystemQueryType) -> Self {
        SystemQuery {
            query_type: query_type.tag(),
            payloads: Vec::new(),
        }
    }

    /// Serialize the query payload
    pub fn serialize(&self) -> Result<Vec<u8>, ProtocolError> {
        to_vec(
            move |out| {
                let mut out = gen_field_i32(1, self.query_type)(out)?;
                for payload in &self.payloads {
                    out = gen_field_bytes(2, payload)(out)?;
                }
                Ok(out)
            },
            "SystemQuery",
        )
    }

    /// Parse a query payload
    pub fn deserialize(buf: &[u8]) -> Result<Self, ProtocolError> {
        let mut query = SystemQuery::default();
        each_field("SystemQuery", buf, |number, value| {
            match number {
                1 => query.query_type = value.as_i32(),
                2 => query.payloads.push(value.as_bytes().to_vec()),
                _ => {}
            }
            Ok(())
        })?;
        Ok(query)
    }
}

/// Role of the user holding the phone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserRole {
    /// Behind the wheel
    Driver,
    /// Along for the ride
    Passenger,
}

/// Response to [`SystemQueryType::UserRole`]. Field `1` role (enum,
/// driver=1, passenger=2).
pub(crate) fn parse_user_role(buf: &[u8]) -> Result<Option<UserRole>, ProtocolError> {
    let mut role = 0;
    each_field("UserRoleResponse", buf, |number, value| {
        if number == 1 {
            role = value.as_i32();
        }
        Ok(())
    })?;
    Ok(match role {
        1 => Some(UserRole::Driver),
        2 => Some(UserRole::Passenger),
        _ => None,
    })
}

/// One entry of a feature-support response.
///
/// Fields: `1` feature_id (string), `2` supported (bool).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSupportStatus {
    /// The queried UUID, echoed as sent
    pub feature_id: String,
    /// Whether a feature is registered for it
    pub supported: bool,
}

/// Response to [`SystemQueryType::IsFeatureSupported`]: repeated field `1`
/// of [`FeatureSupportStatus`] messages.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FeatureSupportResponse {
    /// One status per well-formed queried UUID
    pub statuses: Vec<FeatureSupportStatus>,
}

impl FeatureSupportResponse {
    /// Serialize the response payload
    pub fn serialize(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut nested = Vec::with_capacity(self.statuses.len());
        for status in &self.statuses {
            let bytes = to_vec(
                move |out| {
                    let out = gen_field_bytes(1, status.feature_id.as_bytes())(out)?;
                    if status.supported {
                        gen_field_i32(2, 1)(out)
                    } else {
                        Ok(out)
                    }
                },
                "FeatureSupportStatus",
            )?;
            nested.push(bytes);
        }
        to_vec(
            move |out| {
                let mut out = out;
                for bytes in &nested {
                    out = gen_field_bytes(1, bytes)(out)?;
                }
                Ok(out)
            },
            "FeatureSupportResponse",
        )
    }

    /// Parse a response payload
    pub fn deserialize(buf: &[u8]) -> Result<Self, ProtocolError> {
        let mut response = FeatureSupportResponse::default();
        each_field("FeatureSupportResponse", buf, |number, value| {
            if number != 1 {
                return Ok(());
            }
            let mut feature_id = String::new();
            let mut supported = false;
            each_field("FeatureSupportStatus", value.as_bytes(), |number, value| {
                match number {
                    1 => {
                        feature_id = String::from_utf8(value.as_bytes().to_vec())
                            .map_err(|_| ProtocolError::Parse("FeatureSupportStatus id"))?
                    }
                    2 => supported = value.as_bool(),
                    _ => {}
                }
                Ok(())
            })?;
            response.statuses.push(FeatureSupportStatus {
                feature_id,
                supported,
            });
            Ok(())
        })?;
        Ok(response)
    }
}

/// Built-in feature answering system queries
pub struct SystemFeature {
    host: Weak<FeatureHost>,
    device_name: String,
    app_name: Option<String>,
}

impl SystemFeature {
    pub(crate) fn new(host: Weak<FeatureHost>, config: &CompanionConfig) -> Self {
        SystemFeature {
            host,
            device_name: config.device_name.clone(),
            app_name: config.app_name.clone(),
        }
    }
}

#[async_trait]
impl Feature for SystemFeature {
    fn recipient(&self) -> Uuid {
        SYSTEM_FEATURE_UUID
    }

    async fn on_query_received(&self, query: ReceivedQuery, car: &Car, responder: QueryResponder) {
        let parsed = match SystemQuery::deserialize(&query.query.request) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Unparseable system query from {}: {e}", car.id);
                let _ = responder.respond(false, Vec::new()).await;
                return;
            }
        };
        let result = match SystemQueryType::from_tag(parsed.query_type) {
            Some(SystemQueryType::DeviceName) => {
                responder
                    .respond(true, self.device_name.as_bytes().to_vec())
                    .await
            }
            Some(SystemQueryType::AppName) => match &self.app_name {
                Some(app_name) => responder.respond(true, app_name.as_bytes().to_vec()).await,
                None => responder.respond(false, Vec::new()).await,
            },
            Some(SystemQueryType::IsFeatureSupported) => {
                let Some(host) = self.host.upgrade() else {
                    let _ = responder.respond(false, Vec::new()).await;
                    return;
                };
                // Malformed UUIDs are silently omitted from the response
                let statuses: Vec<FeatureSupportStatus> = parsed
                    .payloads
                    .iter()
                    .filter_map(|payload| {
                        let feature_id = std::str::from_utf8(payload).ok()?;
                        let uuid = Uuid::parse_str(feature_id).ok()?;
                        Some(FeatureSupportStatus {
                            feature_id: feature_id.to_string(),
                            supported: host.is_feature_registered(uuid),
                        })
                    })
                    .collect();
                match (FeatureSupportResponse { statuses }).serialize() {
                    Ok(payload) => responder.respond(true, payload).await,
                    Err(_) => responder.respond(false, Vec::new()).await,
                }
            }
            // The head unit owns role assignment; the phone only queries it
            Some(SystemQueryType::UserRole) | None => {
                responder.respond(false, Vec::new()).await
            }
        };
        if let Err(e) = result {
            debug!("Could not answer system query: {e}");
        }
    }
}

/// Ask the head unit which role this phone's user has
pub(crate) async fn query_user_role(
    channel: &SecuredChannel,
) -> carlink_core::Result<Option<UserRole>> {
    let request = SystemQuery::of(SystemQueryType::UserRole).serialize()?;
    let pending = channel
        .send_query(
            Query {
                request,
                parameters: None,
            },
            SYSTEM_FEATURE_UUID,
            SYSTEM_FEATURE_UUID,
        )
        .await?;
    let response = pending.response().await?;
    if !response.is_successful {
        return Ok(None);
    }
    Ok(parse_user_role(&response.response)?)
}
