use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::display::RenderInstruction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    Provisioning,
    Normal,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Provisioning => "PROVISIONING",
            Self::Normal => "NORMAL",
        }
    }
}

/// Unit of merging: a partial update replaces a whole group or leaves it alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldGroup {
    Hostname,
    TimeZone,
    Color,
    NightOff,
    Dim,
}

/// Flat key/value view served by the config read endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigDocument {
    pub hostname: String,
    pub ssid: String,
    #[serde(rename = "wifiPassSet")]
    pub wifi_pass_set: bool,
    #[serde(rename = "timeZoneOffset")]
    pub time_zone_offset: i32,
    #[serde(rename = "dayLightSaving")]
    pub day_light_saving: bool,
    #[serde(rename = "colorRed")]
    pub color_red: u8,
    #[serde(rename = "colorGreen")]
    pub color_green: u8,
    #[serde(rename = "colorBlue")]
    pub color_blue: u8,
    #[serde(rename = "nightOffActive")]
    pub night_off_active: bool,
    #[serde(rename = "nightOffOffHour")]
    pub night_off_off_hour: u8,
    #[serde(rename = "nightOffOffMinute")]
    pub night_off_off_minute: u8,
    #[serde(rename = "nightOffOnHour")]
    pub night_off_on_hour: u8,
    #[serde(rename = "nightOffOnMinute")]
    pub night_off_on_minute: u8,
    #[serde(rename = "dimActive")]
    pub dim_active: bool,
    #[serde(rename = "dimBase")]
    pub dim_base: u8,
    #[serde(rename = "dimScale")]
    pub dim_scale: u8,
}

/// Partial update accepted by the config write endpoint.
///
/// Each field is decoded on its own: a value of the wrong type lands in
/// `malformed` and rejects only its own field-group, never the document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "RawConfigUpdate")]
pub struct ConfigUpdate {
    pub hostname: Option<String>,
    pub time_zone_offset: Option<i64>,
    pub day_light_saving: Option<bool>,
    pub color: ColorUpdate,
    pub night_off_active: Option<bool>,
    pub night_off_off_hour: Option<i64>,
    pub night_off_off_minute: Option<i64>,
    pub night_off_on_hour: Option<i64>,
    pub night_off_on_minute: Option<i64>,
    pub dim_active: Option<bool>,
    pub dim_base: Option<i64>,
    pub dim_scale: Option<i64>,
    /// Fields that were present but could not be read, tagged with their group.
    pub malformed: Vec<RejectedField>,
}

impl ConfigUpdate {
    /// First unreadable field of `group`, if any.
    pub fn malformed_in(&self, group: FieldGroup) -> Option<&RejectedField> {
        self.malformed
            .iter()
            .chain(&self.color.malformed)
            .find(|field| field.group == group)
    }

    pub fn touches_hostname(&self) -> bool {
        self.hostname.is_some() || self.malformed_in(FieldGroup::Hostname).is_some()
    }

    pub fn touches_time_zone(&self) -> bool {
        self.time_zone_offset.is_some()
            || self.day_light_saving.is_some()
            || self.malformed_in(FieldGroup::TimeZone).is_some()
    }

    pub fn touches_night_off(&self) -> bool {
        self.night_off_active.is_some()
            || self.night_off_off_hour.is_some()
            || self.night_off_off_minute.is_some()
            || self.night_off_on_hour.is_some()
            || self.night_off_on_minute.is_some()
            || self.malformed_in(FieldGroup::NightOff).is_some()
    }

    pub fn touches_dim(&self) -> bool {
        self.dim_active.is_some()
            || self.dim_base.is_some()
            || self.dim_scale.is_some()
            || self.malformed_in(FieldGroup::Dim).is_some()
    }
}

/// Body of the color-test endpoint; any subset of channels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "RawColorUpdate")]
pub struct ColorUpdate {
    pub red: Option<i64>,
    pub green: Option<i64>,
    pub blue: Option<i64>,
    pub malformed: Vec<RejectedField>,
}

impl ColorUpdate {
    pub fn is_empty(&self) -> bool {
        self.red.is_none()
            && self.green.is_none()
            && self.blue.is_none()
            && self.malformed.is_empty()
    }
}

#[derive(Deserialize)]
struct RawConfigUpdate {
    #[serde(default)]
    hostname: Option<Value>,
    #[serde(rename = "timeZoneOffset", alias = "timeZoneOffsetHours", default)]
    time_zone_offset: Option<Value>,
    #[serde(rename = "dayLightSaving", alias = "daylightSaving", default)]
    day_light_saving: Option<Value>,
    #[serde(flatten)]
    color: RawColorUpdate,
    #[serde(rename = "nightOffActive", default)]
    night_off_active: Option<Value>,
    #[serde(rename = "nightOffOffHour", default)]
    night_off_off_hour: Option<Value>,
    #[serde(rename = "nightOffOffMinute", default)]
    night_off_off_minute: Option<Value>,
    #[serde(rename = "nightOffOnHour", default)]
    night_off_on_hour: Option<Value>,
    #[serde(rename = "nightOffOnMinute", default)]
    night_off_on_minute: Option<Value>,
    #[serde(rename = "dimActive", default)]
    dim_active: Option<Value>,
    #[serde(rename = "dimBase", default)]
    dim_base: Option<Value>,
    #[serde(rename = "dimScale", default)]
    dim_scale: Option<Value>,
}

#[derive(Deserialize)]
struct RawColorUpdate {
    #[serde(rename = "colorRed", default)]
    red: Option<Value>,
    #[serde(rename = "colorGreen", default)]
    green: Option<Value>,
    #[serde(rename = "colorBlue", default)]
    blue: Option<Value>,
}

/// Collects typed values and records the fields that fail to convert.
struct FieldReader {
    malformed: Vec<RejectedField>,
}

impl FieldReader {
    fn read<T: DeserializeOwned>(
        &mut self,
        group: FieldGroup,
        field: &'static str,
        value: Option<Value>,
    ) -> Option<T> {
        match serde_json::from_value(value?) {
            Ok(value) => Some(value),
            Err(err) => {
                self.malformed.push(RejectedField {
                    group,
                    field,
                    reason: err.to_string(),
                });
                None
            }
        }
    }
}

impl From<RawConfigUpdate> for ConfigUpdate {
    fn from(raw: RawConfigUpdate) -> Self {
        use FieldGroup::{Dim, Hostname, NightOff, TimeZone};

        let mut reader = FieldReader {
            malformed: Vec::new(),
        };
        Self {
            hostname: reader.read(Hostname, "hostname", raw.hostname),
            time_zone_offset: reader.read(TimeZone, "timeZoneOffset", raw.time_zone_offset),
            day_light_saving: reader.read(TimeZone, "dayLightSaving", raw.day_light_saving),
            color: raw.color.into(),
            night_off_active: reader.read(NightOff, "nightOffActive", raw.night_off_active),
            night_off_off_hour: reader.read(NightOff, "nightOffOffHour", raw.night_off_off_hour),
            night_off_off_minute: reader.read(
                NightOff,
                "nightOffOffMinute",
                raw.night_off_off_minute,
            ),
            night_off_on_hour: reader.read(NightOff, "nightOffOnHour", raw.night_off_on_hour),
            night_off_on_minute: reader.read(
                NightOff,
                "nightOffOnMinute",
                raw.night_off_on_minute,
            ),
            dim_active: reader.read(Dim, "dimActive", raw.dim_active),
            dim_base: reader.read(Dim, "dimBase", raw.dim_base),
            dim_scale: reader.read(Dim, "dimScale", raw.dim_scale),
            malformed: reader.malformed,
        }
    }
}

impl From<RawColorUpdate> for ColorUpdate {
    fn from(raw: RawColorUpdate) -> Self {
        let mut reader = FieldReader {
            malformed: Vec::new(),
        };
        Self {
            red: reader.read(FieldGroup::Color, "colorRed", raw.red),
            green: reader.read(FieldGroup::Color, "colorGreen", raw.green),
            blue: reader.read(FieldGroup::Color, "colorBlue", raw.blue),
            malformed: reader.malformed,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProvisioningRequest {
    #[serde(default)]
    pub ssid: Option<String>,
    #[serde(default)]
    pub passwd: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RejectedField {
    pub group: FieldGroup,
    pub field: &'static str,
    pub reason: String,
}

/// Outcome of a mutation entry point, serialized back to the transport.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct MutationReport {
    pub applied: Vec<FieldGroup>,
    pub rejected: Vec<RejectedField>,
    pub persisted: bool,
    #[serde(rename = "persistError", skip_serializing_if = "Option::is_none")]
    pub persist_error: Option<String>,
}

impl MutationReport {
    pub fn is_rejected(&self) -> bool {
        !self.rejected.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub mode: &'static str,
    pub hostname: String,
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
    #[serde(rename = "persistPending")]
    pub persist_pending: bool,
    #[serde(rename = "restartPending")]
    pub restart_pending: bool,
    #[serde(rename = "lastRender")]
    pub last_render: Option<RenderInstruction>,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn wrong_typed_fields_are_recorded_per_group() {
        let update: ConfigUpdate = serde_json::from_str(
            r#"{"hostname": 5, "timeZoneOffset": 2, "dimScale": "x", "colorBlue": true}"#,
        )
        .unwrap();

        assert_eq!(update.hostname, None);
        assert_eq!(update.time_zone_offset, Some(2));
        assert_eq!(update.dim_scale, None);
        assert!(update.touches_hostname());
        assert!(update.touches_dim());
        assert!(!update.touches_night_off());
        assert!(!update.color.is_empty());

        let groups: Vec<_> = update.malformed.iter().map(|field| field.group).collect();
        assert_eq!(groups, vec![FieldGroup::Hostname, FieldGroup::Dim]);
        assert_eq!(
            update.malformed_in(FieldGroup::Color).map(|field| field.field),
            Some("colorBlue")
        );
    }

    #[test]
    fn field_groups_name_only_mergeable_groups() {
        let names: Vec<_> = [
            FieldGroup::Hostname,
            FieldGroup::TimeZone,
            FieldGroup::Color,
            FieldGroup::NightOff,
            FieldGroup::Dim,
        ]
        .iter()
        .map(|group| serde_json::to_value(group).unwrap())
        .collect();

        assert_eq!(
            names,
            vec!["hostname", "timeZone", "color", "nightOff", "dim"]
        );
        assert!(serde_json::from_str::<FieldGroup>(r#""credentials""#).is_err());
    }
}
