use serde::{Deserialize, Serialize};

use crate::{
    error::{ClockError, StorageError},
    store::encode_configuration,
    types::{ColorUpdate, ConfigDocument, ConfigUpdate, FieldGroup, RejectedField},
};

pub const DEFAULT_HOSTNAME: &str = "wordclock";
pub const MAX_HOSTNAME_LEN: usize = 32;
pub const MAX_SSID_LEN: usize = 32;
pub const MAX_PASSWORD_LEN: usize = 64;
pub const MIN_TIME_ZONE_OFFSET: i32 = -12;
pub const MAX_TIME_ZONE_OFFSET: i32 = 14;

pub const PROVISIONING_AP_SSID: &str = "WORTUHR_AP";
pub const PROVISIONING_AP_IP: [u8; 4] = [192, 168, 25, 1];
pub const PROVISIONING_AP_GATEWAY: [u8; 4] = [192, 168, 25, 1];
pub const PROVISIONING_AP_NETMASK: [u8; 4] = [255, 255, 255, 0];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerTiming {
    pub tick_interval_ms: u64,
    pub persist_retry_ms: u64,
    pub restart_delay_ms: u64,
}

impl Default for ControllerTiming {
    fn default() -> Self {
        Self {
            tick_interval_ms: 250,
            persist_retry_ms: 1_000,
            restart_delay_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl Default for Color {
    fn default() -> Self {
        Self {
            red: 255,
            green: 255,
            blue: 255,
        }
    }
}

impl Color {
    pub const BLACK: Self = Self {
        red: 0,
        green: 0,
        blue: 0,
    };

    pub fn scaled(self, scale: f32) -> Self {
        let scale = if scale.is_finite() {
            scale.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let channel = |value: u8| (f32::from(value) * scale).round() as u8;
        Self {
            red: channel(self.red),
            green: channel(self.green),
            blue: channel(self.blue),
        }
    }
}

/// Daily window during which the display is forced dark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NightOff {
    pub active: bool,
    pub off_hour: u8,
    pub off_minute: u8,
    pub on_hour: u8,
    pub on_minute: u8,
}

impl Default for NightOff {
    fn default() -> Self {
        Self {
            active: false,
            off_hour: 22,
            off_minute: 0,
            on_hour: 6,
            on_minute: 0,
        }
    }
}

impl NightOff {
    /// Half-open `[off, on)` on a 24h cycle. Equal endpoints mean an empty window.
    pub fn contains(&self, hour: u8, minute: u8) -> bool {
        let now = minute_of_day(hour, minute);
        let off = minute_of_day(self.off_hour, self.off_minute);
        let on = minute_of_day(self.on_hour, self.on_minute);

        if off <= on {
            off <= now && now < on
        } else {
            now >= off || now < on
        }
    }
}

fn minute_of_day(hour: u8, minute: u8) -> u16 {
    u16::from(hour) * 60 + u16::from(minute)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dim {
    pub active: bool,
    pub base: u8,
    pub scale: u8,
}

impl Default for Dim {
    fn default() -> Self {
        Self {
            active: false,
            base: 128,
            scale: 255,
        }
    }
}

impl Dim {
    /// `base / scale` clamped into `[0, 1]`; a zero scale never dims.
    pub fn brightness(&self) -> f32 {
        if self.scale == 0 {
            return 1.0;
        }
        (f32::from(self.base) / f32::from(self.scale)).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    pub hostname: String,
    pub ssid: String,
    pub wifi_password: String,
    pub time_zone_offset_hours: i32,
    pub daylight_saving: bool,
    pub color: Color,
    pub night_off: NightOff,
    pub dim: Dim,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            hostname: DEFAULT_HOSTNAME.to_string(),
            ssid: String::new(),
            wifi_password: String::new(),
            time_zone_offset_hours: 1,
            daylight_saving: false,
            color: Color::default(),
            night_off: NightOff::default(),
            dim: Dim::default(),
        }
    }
}

impl Configuration {
    pub fn is_provisioned(&self) -> bool {
        !self.ssid.is_empty()
    }

    /// Pulls every field back into range after loading a stored copy.
    pub fn sanitize(&mut self) {
        let hostname_valid =
            matches!(merge_hostname(&self.hostname), Ok(hostname) if hostname == self.hostname);
        if !hostname_valid {
            self.hostname = DEFAULT_HOSTNAME.to_string();
        }
        self.time_zone_offset_hours = self
            .time_zone_offset_hours
            .clamp(MIN_TIME_ZONE_OFFSET, MAX_TIME_ZONE_OFFSET);

        self.night_off.off_hour = self.night_off.off_hour.min(23);
        self.night_off.off_minute = self.night_off.off_minute.min(59);
        self.night_off.on_hour = self.night_off.on_hour.min(23);
        self.night_off.on_minute = self.night_off.on_minute.min(59);

        if self.dim.scale == 0 {
            self.dim.scale = 1;
        }
    }

    pub fn document(&self) -> ConfigDocument {
        ConfigDocument {
            hostname: self.hostname.clone(),
            ssid: self.ssid.clone(),
            wifi_pass_set: !self.wifi_password.is_empty(),
            time_zone_offset: self.time_zone_offset_hours,
            day_light_saving: self.daylight_saving,
            color_red: self.color.red,
            color_green: self.color.green,
            color_blue: self.color.blue,
            night_off_active: self.night_off.active,
            night_off_off_hour: self.night_off.off_hour,
            night_off_off_minute: self.night_off.off_minute,
            night_off_on_hour: self.night_off.on_hour,
            night_off_on_minute: self.night_off.on_minute,
            dim_active: self.dim.active,
            dim_base: self.dim.base,
            dim_scale: self.dim.scale,
        }
    }

    /// Merges every field-group present in `update`. Groups that fail
    /// validation, carry an unreadable field, or would push the encoded
    /// configuration past storage keep their stored value and are returned
    /// as rejections.
    pub fn merge(&mut self, update: &ConfigUpdate) -> (Vec<FieldGroup>, Vec<RejectedField>) {
        let mut applied = Vec::new();
        let mut rejected = Vec::new();

        if update.touches_hostname() {
            let result = self.merge_group(|next| {
                reject_malformed(update, FieldGroup::Hostname)?;
                next.hostname = merge_hostname(update.hostname.as_deref().unwrap_or_default())?;
                Ok(())
            });
            record(FieldGroup::Hostname, result, &mut applied, &mut rejected);
        }

        if update.touches_time_zone() {
            let result = self.merge_group(|next| {
                let (offset, dst) = merge_time_zone(next, update)?;
                next.time_zone_offset_hours = offset;
                next.daylight_saving = dst;
                Ok(())
            });
            record(FieldGroup::TimeZone, result, &mut applied, &mut rejected);
        }

        if !update.color.is_empty() {
            let result = self.merge_group(|next| {
                next.color = merge_color(next.color, &update.color)?;
                Ok(())
            });
            record(FieldGroup::Color, result, &mut applied, &mut rejected);
        }

        if update.touches_night_off() {
            let result = self.merge_group(|next| {
                next.night_off = merge_night_off(next.night_off, update)?;
                Ok(())
            });
            record(FieldGroup::NightOff, result, &mut applied, &mut rejected);
        }

        if update.touches_dim() {
            let result = self.merge_group(|next| {
                next.dim = merge_dim(next.dim, update)?;
                Ok(())
            });
            record(FieldGroup::Dim, result, &mut applied, &mut rejected);
        }

        (applied, rejected)
    }

    /// Rejects a configuration whose encoding would not fit the storage slot.
    pub fn ensure_fits_storage(&self) -> Result<(), ClockError> {
        match encode_configuration(self) {
            Ok(_) => Ok(()),
            Err(StorageError::TooLarge { size, capacity }) => Err(ClockError::validation(
                "configuration",
                format!("encodes to {size} bytes, storage holds at most {capacity}"),
            )),
            Err(err) => Err(err.into()),
        }
    }

    fn merge_group<F>(&mut self, merge: F) -> Result<(), ClockError>
    where
        F: FnOnce(&mut Configuration) -> Result<(), ClockError>,
    {
        let mut next = self.clone();
        merge(&mut next)?;
        next.ensure_fits_storage()?;
        *self = next;
        Ok(())
    }
}

fn record(
    group: FieldGroup,
    result: Result<(), ClockError>,
    applied: &mut Vec<FieldGroup>,
    rejected: &mut Vec<RejectedField>,
) {
    match result {
        Ok(()) => applied.push(group),
        Err(ClockError::Validation { field, reason }) => rejected.push(RejectedField {
            group,
            field,
            reason,
        }),
        Err(other) => rejected.push(RejectedField {
            group,
            field: "",
            reason: other.to_string(),
        }),
    }
}

/// Hostnames follow RFC 1123 labels: ASCII letters, digits and inner hyphens.
pub fn merge_hostname(hostname: &str) -> Result<String, ClockError> {
    let hostname = hostname.trim();
    if hostname.is_empty() {
        return Err(ClockError::validation("hostname", "must not be empty"));
    }
    if hostname.len() > MAX_HOSTNAME_LEN {
        return Err(ClockError::validation(
            "hostname",
            format!("longer than {MAX_HOSTNAME_LEN} bytes"),
        ));
    }
    if !is_valid_hostname(hostname) {
        return Err(ClockError::validation(
            "hostname",
            "only letters, digits and inner hyphens are allowed",
        ));
    }
    Ok(hostname.to_string())
}

fn is_valid_hostname(hostname: &str) -> bool {
    !hostname.starts_with('-')
        && !hostname.ends_with('-')
        && hostname
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || byte == b'-')
}

pub fn merge_time_zone(
    current: &Configuration,
    update: &ConfigUpdate,
) -> Result<(i32, bool), ClockError> {
    reject_malformed(update, FieldGroup::TimeZone)?;
    let offset = match update.time_zone_offset {
        Some(value) => {
            if !(i64::from(MIN_TIME_ZONE_OFFSET)..=i64::from(MAX_TIME_ZONE_OFFSET))
                .contains(&value)
            {
                return Err(ClockError::validation(
                    "timeZoneOffset",
                    format!("{value} outside {MIN_TIME_ZONE_OFFSET}..={MAX_TIME_ZONE_OFFSET}"),
                ));
            }
            value as i32
        }
        None => current.time_zone_offset_hours,
    };
    let dst = update.day_light_saving.unwrap_or(current.daylight_saving);
    Ok((offset, dst))
}

/// Channels missing from `update` keep their value from `current`.
pub fn merge_color(current: Color, update: &ColorUpdate) -> Result<Color, ClockError> {
    if let Some(field) = update.malformed.first() {
        return Err(ClockError::validation(field.field, field.reason.clone()));
    }
    Ok(Color {
        red: optional_in_range("colorRed", update.red, 0, 255)?.unwrap_or(current.red),
        green: optional_in_range("colorGreen", update.green, 0, 255)?.unwrap_or(current.green),
        blue: optional_in_range("colorBlue", update.blue, 0, 255)?.unwrap_or(current.blue),
    })
}

pub fn merge_night_off(current: NightOff, update: &ConfigUpdate) -> Result<NightOff, ClockError> {
    reject_malformed(update, FieldGroup::NightOff)?;
    Ok(NightOff {
        active: update.night_off_active.unwrap_or(current.active),
        off_hour: optional_in_range("nightOffOffHour", update.night_off_off_hour, 0, 23)?
            .unwrap_or(current.off_hour),
        off_minute: optional_in_range("nightOffOffMinute", update.night_off_off_minute, 0, 59)?
            .unwrap_or(current.off_minute),
        on_hour: optional_in_range("nightOffOnHour", update.night_off_on_hour, 0, 23)?
            .unwrap_or(current.on_hour),
        on_minute: optional_in_range("nightOffOnMinute", update.night_off_on_minute, 0, 59)?
            .unwrap_or(current.on_minute),
    })
}

pub fn merge_dim(current: Dim, update: &ConfigUpdate) -> Result<Dim, ClockError> {
    reject_malformed(update, FieldGroup::Dim)?;
    Ok(Dim {
        active: update.dim_active.unwrap_or(current.active),
        base: optional_in_range("dimBase", update.dim_base, 0, 255)?.unwrap_or(current.base),
        scale: optional_in_range("dimScale", update.dim_scale, 1, 255)?.unwrap_or(current.scale),
    })
}

pub fn validate_credentials(ssid: &str, password: &str) -> Result<(), ClockError> {
    if ssid.trim().is_empty() {
        return Err(ClockError::validation("ssid", "must not be empty"));
    }
    if ssid.len() > MAX_SSID_LEN {
        return Err(ClockError::validation(
            "ssid",
            format!("longer than {MAX_SSID_LEN} bytes"),
        ));
    }
    if password.len() > MAX_PASSWORD_LEN {
        return Err(ClockError::validation(
            "passwd",
            format!("longer than {MAX_PASSWORD_LEN} bytes"),
        ));
    }
    Ok(())
}

fn reject_malformed(update: &ConfigUpdate, group: FieldGroup) -> Result<(), ClockError> {
    match update.malformed_in(group) {
        Some(field) => Err(ClockError::validation(field.field, field.reason.clone())),
        None => Ok(()),
    }
}

fn optional_in_range(
    field: &'static str,
    value: Option<i64>,
    min: u8,
    max: u8,
) -> Result<Option<u8>, ClockError> {
    match value {
        None => Ok(None),
        Some(value) if (i64::from(min)..=i64::from(max)).contains(&value) => Ok(Some(value as u8)),
        Some(value) => Err(ClockError::validation(
            field,
            format!("{value} outside {min}..={max}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn window(off: (u8, u8), on: (u8, u8)) -> NightOff {
        NightOff {
            active: true,
            off_hour: off.0,
            off_minute: off.1,
            on_hour: on.0,
            on_minute: on.1,
        }
    }

    #[test]
    fn daytime_window_is_half_open() {
        let night_off = window((8, 0), (20, 0));

        assert!(night_off.contains(8, 0));
        assert!(night_off.contains(12, 30));
        assert!(night_off.contains(19, 59));
        assert!(!night_off.contains(20, 0));
        assert!(!night_off.contains(7, 59));
        assert!(!night_off.contains(23, 0));
    }

    #[test]
    fn window_wraps_past_midnight() {
        let night_off = window((22, 0), (6, 0));

        assert!(night_off.contains(22, 0));
        assert!(night_off.contains(23, 59));
        assert!(night_off.contains(0, 0));
        assert!(night_off.contains(5, 59));
        assert!(!night_off.contains(6, 0));
        assert!(!night_off.contains(21, 59));
        assert!(!night_off.contains(12, 0));
    }

    #[test]
    fn equal_endpoints_form_empty_window() {
        let night_off = window((3, 15), (3, 15));
        for hour in 0..24 {
            for minute in 0..60 {
                assert!(!night_off.contains(hour, minute));
            }
        }
    }

    #[test]
    fn dim_brightness_is_clamped_fraction() {
        let dim = |base, scale| Dim {
            active: true,
            base,
            scale,
        };

        assert_eq!(dim(128, 255).brightness(), 128.0 / 255.0);
        assert_eq!(dim(255, 100).brightness(), 1.0);
        assert_eq!(dim(0, 10).brightness(), 0.0);
        assert_eq!(dim(10, 0).brightness(), 1.0);
    }

    #[test]
    fn partial_color_keeps_omitted_channels() {
        let mut config = Configuration {
            color: Color {
                red: 10,
                green: 20,
                blue: 30,
            },
            ..Configuration::default()
        };
        let before = config.clone();

        let update = ConfigUpdate {
            color: ColorUpdate {
                red: Some(200),
                ..ColorUpdate::default()
            },
            ..ConfigUpdate::default()
        };
        let (applied, rejected) = config.merge(&update);

        assert_eq!(applied, vec![FieldGroup::Color]);
        assert!(rejected.is_empty());
        assert_eq!(
            config,
            Configuration {
                color: Color {
                    red: 200,
                    green: 20,
                    blue: 30,
                },
                ..before
            }
        );
    }

    #[test]
    fn invalid_group_is_rejected_whole_while_others_apply() {
        let mut config = Configuration::default();
        let update = ConfigUpdate {
            night_off_active: Some(true),
            night_off_off_hour: Some(24),
            dim_active: Some(true),
            dim_base: Some(64),
            ..ConfigUpdate::default()
        };

        let (applied, rejected) = config.merge(&update);

        assert_eq!(applied, vec![FieldGroup::Dim]);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].group, FieldGroup::NightOff);
        assert_eq!(rejected[0].field, "nightOffOffHour");
        assert_eq!(config.night_off, NightOff::default());
        assert!(config.dim.active);
        assert_eq!(config.dim.base, 64);
    }

    #[test]
    fn out_of_range_values_are_rejected_not_clamped() {
        let current = Color::default();
        let update = ColorUpdate {
            green: Some(256),
            ..ColorUpdate::default()
        };
        assert!(merge_color(current, &update).unwrap_err().is_validation());

        let update = ConfigUpdate {
            time_zone_offset: Some(15),
            ..ConfigUpdate::default()
        };
        assert!(merge_time_zone(&Configuration::default(), &update).is_err());

        let update = ConfigUpdate {
            dim_scale: Some(0),
            ..ConfigUpdate::default()
        };
        assert!(merge_dim(Dim::default(), &update).is_err());

        assert!(merge_hostname("   ").is_err());
    }

    #[test]
    fn time_zone_group_merges_offset_and_dst_together() {
        let mut config = Configuration {
            time_zone_offset_hours: 2,
            daylight_saving: true,
            ..Configuration::default()
        };
        let update = ConfigUpdate {
            time_zone_offset: Some(-5),
            ..ConfigUpdate::default()
        };

        let (applied, _) = config.merge(&update);

        assert_eq!(applied, vec![FieldGroup::TimeZone]);
        assert_eq!(config.time_zone_offset_hours, -5);
        assert!(config.daylight_saving);
    }

    #[test]
    fn sanitize_restores_invariants() {
        let mut config = Configuration {
            hostname: String::new(),
            time_zone_offset_hours: 40,
            night_off: NightOff {
                active: true,
                off_hour: 99,
                off_minute: 75,
                on_hour: 24,
                on_minute: 60,
            },
            dim: Dim {
                active: true,
                base: 10,
                scale: 0,
            },
            ..Configuration::default()
        };

        config.sanitize();

        assert_eq!(config.hostname, DEFAULT_HOSTNAME);
        assert_eq!(config.time_zone_offset_hours, MAX_TIME_ZONE_OFFSET);
        assert_eq!(
            config.night_off,
            NightOff {
                active: true,
                off_hour: 23,
                off_minute: 59,
                on_hour: 23,
                on_minute: 59,
            }
        );
        assert_eq!(config.dim.scale, 1);
    }

    #[test]
    fn credentials_require_ssid() {
        assert!(validate_credentials("", "secret").is_err());
        assert!(validate_credentials("home", "").is_ok());
        assert!(validate_credentials(&"x".repeat(33), "").is_err());
    }

    #[test]
    fn config_update_accepts_short_and_long_key_names() {
        let update: ConfigUpdate = serde_json::from_str(
            r#"{"timeZoneOffsetHours": 3, "daylightSaving": true, "colorRed": 7, "unknown": 1}"#,
        )
        .unwrap();

        assert_eq!(update.time_zone_offset, Some(3));
        assert_eq!(update.day_light_saving, Some(true));
        assert_eq!(update.color.red, Some(7));
        assert_eq!(update.color.green, None);
    }

    #[test]
    fn hostname_allows_only_label_characters() {
        assert_eq!(merge_hostname(" desk-clock-2 ").unwrap(), "desk-clock-2");
        for hostname in ["say\"hi\"", "back\\slash", "two words", "-lead", "trail-", "\u{1}"] {
            let err = merge_hostname(hostname).unwrap_err();
            assert!(err.is_validation(), "{hostname:?} accepted");
        }
    }

    #[test]
    fn sanitize_replaces_hostname_with_escaped_characters() {
        let mut config = Configuration {
            hostname: "\"".repeat(MAX_HOSTNAME_LEN),
            ..Configuration::default()
        };

        config.sanitize();

        assert_eq!(config.hostname, DEFAULT_HOSTNAME);
    }

    #[test]
    fn mistyped_field_rejects_only_its_group() {
        let mut config = Configuration::default();
        let color = config.color;
        let update: ConfigUpdate =
            serde_json::from_str(r#"{"hostname": "desk", "colorRed": "12"}"#).unwrap();

        let (applied, rejected) = config.merge(&update);

        assert_eq!(applied, vec![FieldGroup::Hostname]);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].group, FieldGroup::Color);
        assert_eq!(rejected[0].field, "colorRed");
        assert_eq!(config.hostname, "desk");
        assert_eq!(config.color, color);
    }

    #[test]
    fn mistyped_night_off_field_keeps_stored_window() {
        let mut config = Configuration::default();
        let night_off = config.night_off;
        let update: ConfigUpdate =
            serde_json::from_str(r#"{"nightOffActive": "yes", "dimBase": 40}"#).unwrap();

        let (applied, rejected) = config.merge(&update);

        assert_eq!(applied, vec![FieldGroup::Dim]);
        assert_eq!(rejected[0].group, FieldGroup::NightOff);
        assert_eq!(config.night_off, night_off);
        assert_eq!(config.dim.base, 40);
    }
}
