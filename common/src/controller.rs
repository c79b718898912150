use crate::{
    config::{Configuration, ControllerTiming},
    display::{render, RenderInstruction, RenderSink},
    error::{ClockError, StorageError},
    store::{BlobStorage, ConfigStore},
    time::{adjust, TimeSource},
    types::{
        ColorUpdate, ConfigDocument, ConfigUpdate, ControllerStatus, FieldGroup, Mode,
        MutationReport, ProvisioningRequest, RejectedField,
    },
};

/// Result of one control-loop iteration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickOutcome {
    /// Instruction handed to the sink this tick, if any.
    pub applied: Option<RenderInstruction>,
    pub time_synced: bool,
    /// Set when a pending persist was retried and failed again.
    pub persist_error: Option<String>,
}

/// Chooses between provisioning and normal operation once at startup and
/// drives config mutations and rendering ticks for the rest of the process.
#[derive(Debug)]
pub struct ModeController<S> {
    pub timing: ControllerTiming,
    store: ConfigStore<S>,
    mode: Mode,
    force_render: bool,
    last_render: Option<RenderInstruction>,
    time_synced: bool,
    restart_requested: bool,
    persist_retry_at_ms: Option<u64>,
}

impl<S: BlobStorage> ModeController<S> {
    pub fn new(store: ConfigStore<S>, timing: ControllerTiming) -> Self {
        let mode = if store.current().is_provisioned() {
            Mode::Normal
        } else {
            Mode::Provisioning
        };

        Self {
            timing,
            store,
            mode,
            force_render: true,
            last_render: None,
            time_synced: false,
            restart_requested: false,
            persist_retry_at_ms: None,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn config(&self) -> &Configuration {
        self.store.current()
    }

    pub fn store(&self) -> &ConfigStore<S> {
        &self.store
    }

    pub fn document(&self) -> ConfigDocument {
        self.store.current().document()
    }

    pub fn last_render(&self) -> Option<&RenderInstruction> {
        self.last_render.as_ref()
    }

    pub fn is_render_forced(&self) -> bool {
        self.force_render
    }

    pub fn restart_requested(&self) -> bool {
        self.restart_requested
    }

    pub fn has_pending_persist(&self) -> bool {
        self.store.is_dirty()
    }

    pub fn status(&self) -> ControllerStatus {
        ControllerStatus {
            mode: self.mode.as_str(),
            hostname: self.store.current().hostname.clone(),
            time_synced: self.time_synced,
            persist_pending: self.store.is_dirty(),
            restart_pending: self.restart_requested,
            last_render: self.last_render,
        }
    }

    /// Accepts station credentials while provisioning. On success the
    /// credentials are durable and the caller must restart the device.
    pub fn provision(&mut self, request: &ProvisioningRequest) -> Result<(), ClockError> {
        self.require_mode(Mode::Provisioning)?;

        let ssid = request
            .ssid
            .as_deref()
            .ok_or_else(|| ClockError::validation("ssid", "missing"))?;
        self.store.set_credentials(ssid, request.passwd.as_deref())?;
        self.store.persist()?;

        self.restart_requested = true;
        Ok(())
    }

    /// Merges a partial configuration from the config-sync interface.
    pub fn replace_config(
        &mut self,
        update: &ConfigUpdate,
        now_ms: u64,
    ) -> Result<MutationReport, ClockError> {
        self.require_mode(Mode::Normal)?;

        let (applied, rejected) = self.store.replace(update);
        Ok(self.finish_mutation(applied, rejected, now_ms))
    }

    /// Merges a color from the color-test interface.
    pub fn replace_color(
        &mut self,
        update: &ColorUpdate,
        now_ms: u64,
    ) -> Result<MutationReport, ClockError> {
        self.require_mode(Mode::Normal)?;

        let (applied, rejected) = if update.is_empty() {
            (Vec::new(), Vec::new())
        } else {
            match self.store.replace_color(update) {
                Ok(()) => (vec![FieldGroup::Color], Vec::new()),
                Err(ClockError::Validation { field, reason }) => (
                    Vec::new(),
                    vec![RejectedField {
                        group: FieldGroup::Color,
                        field,
                        reason,
                    }],
                ),
                Err(err) => return Err(err),
            }
        };
        Ok(self.finish_mutation(applied, rejected, now_ms))
    }

    /// One iteration of the normal-mode loop: read the clock, adjust it to
    /// local time, derive the display state and hand it to `sink` when it
    /// changed or a re-render was forced. Does nothing while provisioning.
    pub fn tick<T, R>(&mut self, now_ms: u64, time: &mut T, sink: &mut R) -> TickOutcome
    where
        T: TimeSource + ?Sized,
        R: RenderSink + ?Sized,
    {
        let mut outcome = TickOutcome::default();
        if self.mode != Mode::Normal {
            return outcome;
        }

        if let Err(err) = self.retry_persist_if_due(now_ms) {
            outcome.persist_error = Some(err.to_string());
        }

        let config = self.store.current();
        let instruction = match time.raw_time().synced() {
            Ok(raw) => {
                outcome.time_synced = true;
                let local = adjust(
                    raw.hour,
                    raw.minute,
                    config.time_zone_offset_hours,
                    config.daylight_saving,
                );
                render(local, config)
            }
            Err(_) => RenderInstruction::blank(),
        };
        self.time_synced = outcome.time_synced;

        let forced = std::mem::take(&mut self.force_render);
        if forced || self.last_render.as_ref() != Some(&instruction) {
            sink.apply(&instruction);
            self.last_render = Some(instruction);
            outcome.applied = Some(instruction);
        }

        outcome
    }

    fn finish_mutation(
        &mut self,
        applied: Vec<FieldGroup>,
        rejected: Vec<RejectedField>,
        now_ms: u64,
    ) -> MutationReport {
        let mut report = MutationReport {
            applied,
            rejected,
            persisted: !self.store.is_dirty(),
            persist_error: None,
        };
        if report.applied.is_empty() {
            return report;
        }

        self.force_render = true;
        match self.store.persist() {
            Ok(()) => {
                self.persist_retry_at_ms = None;
                report.persisted = true;
            }
            Err(err) => {
                self.schedule_persist_retry(now_ms);
                report.persisted = false;
                report.persist_error = Some(err.to_string());
            }
        }
        report
    }

    fn schedule_persist_retry(&mut self, now_ms: u64) {
        self.persist_retry_at_ms = Some(now_ms.saturating_add(self.timing.persist_retry_ms));
    }

    fn retry_persist_if_due(&mut self, now_ms: u64) -> Result<(), StorageError> {
        if !self.store.is_dirty() {
            self.persist_retry_at_ms = None;
            return Ok(());
        }
        let due = self.persist_retry_at_ms.unwrap_or(now_ms);
        if now_ms < due {
            return Ok(());
        }

        match self.store.persist() {
            Ok(()) => {
                self.persist_retry_at_ms = None;
                Ok(())
            }
            Err(err) => {
                self.schedule_persist_retry(now_ms);
                Err(err)
            }
        }
    }

    fn require_mode(&self, required: Mode) -> Result<(), ClockError> {
        if self.mode == required {
            Ok(())
        } else {
            Err(ClockError::ModeMismatch {
                required,
                current: self.mode,
            })
        }
    }
}
