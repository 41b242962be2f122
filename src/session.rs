//! Aggregated mix state and the sync protocol
//!
//! The session owns the full channel topology built from configuration: per
//! channel a label, color, mute, level and selection cell, and for
//! input-like channels a send-level map that is hydrated on demand. Decoded
//! wire messages resolve onto the matching cell; user intent goes through
//! the `change_*` operations, which queue a request first and only then
//! transmit, so the console's echo can always be correlated.
//!
//! `sync()` is the startup dance that brings this mirror into agreement with
//! the console. Its order matters: mutes and labels are requested inside the
//! mute/colour quirks window because the console mirrors mute *requests* in
//! the byte shape of a colour report (see the decoder); everything else
//! follows once the stream settles.

use std::collections::HashMap;
#[cfg(feature = "s-dca")]
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::codec::{Decoder, DecoderShared, Encoder, Message};
use crate::config::{Config, SceneConfig, TimingConfig};
use crate::entity::{Bank, ChannelIdentifier, Color, Label, Level, Scene};
use crate::event::AsyncEvent;
use crate::scheduler::Scheduler;
use crate::surface::StatusBoard;
use crate::tracking::{TrackedValue, ValueRegistry};
use crate::transport::{CommandSink, PortReader};
use crate::{Result, SurfaceError};

/// Send-level storage of an input-like channel.
///
/// The map stays unallocated until the first read or an explicit hydrate;
/// hydration additionally requests every level from the console.
struct SendStore {
    map: Mutex<Option<HashMap<ChannelIdentifier, TrackedValue<Level>>>>,
    hydrated: AtomicBool,
    #[cfg(feature = "s-dca")]
    snapshot: Mutex<HashMap<ChannelIdentifier, Level>>,
    #[cfg(feature = "s-dca")]
    affected: Mutex<HashSet<ChannelIdentifier>>,
}

impl SendStore {
    fn new() -> Self {
        Self {
            map: Mutex::new(None),
            hydrated: AtomicBool::new(false),
            #[cfg(feature = "s-dca")]
            snapshot: Mutex::new(HashMap::new()),
            #[cfg(feature = "s-dca")]
            affected: Mutex::new(HashSet::new()),
        }
    }
}

/// What a channel is to the session.
enum ChannelKind {
    /// Input-like channel with outgoing sends (inputs, FX returns)
    Input(SendStore),
    /// Send destination with its own master (aux, FX, external FX)
    Multi,
    /// Plain output bus (the virtual feedback matrix)
    Output,
    /// One of the 16 fader strips
    Virtual,
}

struct ChannelState {
    label: TrackedValue<Label>,
    color: TrackedValue<Color>,
    mute: TrackedValue<bool>,
    level: TrackedValue<Level>,
    select: TrackedValue<bool>,
    kind: ChannelKind,
}

impl ChannelState {
    fn send_store(&self) -> Option<&SendStore> {
        match &self.kind {
            ChannelKind::Input(store) => Some(store),
            _ => None,
        }
    }
}

/// The session: container of all tracked state and the operations on it.
///
/// Single instance per process, created at startup. The channel map is
/// immutable after construction, so lookups are lock-free; every cell
/// carries its own lock.
pub struct Session {
    registry: ValueRegistry,
    encoder: Encoder,
    decoder_shared: Arc<DecoderShared>,
    outbound: Arc<dyn CommandSink>,
    scheduler: Arc<Scheduler>,
    status: Arc<StatusBoard>,
    timing: TimingConfig,
    scenes: SceneConfig,
    bank_offset: u8,

    scene: TrackedValue<Scene>,
    feedback_source: Mutex<Option<ChannelIdentifier>>,
    channels: HashMap<ChannelIdentifier, ChannelState>,

    ordering: Vec<ChannelIdentifier>,
    input_channels: Vec<ChannelIdentifier>,
    fx_return_channels: Vec<ChannelIdentifier>,
    send_channels: Vec<ChannelIdentifier>,
    aux_channels: Vec<ChannelIdentifier>,
    fx_channels: Vec<ChannelIdentifier>,
    external_fx_channels: Vec<ChannelIdentifier>,
    virtual_channels: Vec<ChannelIdentifier>,
    virtual_feedback: ChannelIdentifier,
    talk_to_stage: ChannelIdentifier,
    talk_to_monitor: ChannelIdentifier,

    listening: AtomicBool,
    syncing: AtomicBool,

    on_update_scene: AsyncEvent<Scene>,
    on_update_label: AsyncEvent<(ChannelIdentifier, Label)>,
    on_update_color: AsyncEvent<(ChannelIdentifier, Color)>,
    on_update_mute: AsyncEvent<(ChannelIdentifier, bool)>,
    on_update_level: AsyncEvent<(ChannelIdentifier, Level)>,
    on_update_send_level: AsyncEvent<(ChannelIdentifier, ChannelIdentifier, Level)>,
    on_update_select: AsyncEvent<(ChannelIdentifier, bool)>,
    #[cfg(feature = "s-dca")]
    on_update_s_dca: AsyncEvent<(ChannelIdentifier, bool)>,
}

impl Session {
    /// Build the session from configuration.
    ///
    /// Allocates every channel and tracked cell of the configured topology;
    /// nothing is added or removed afterwards.
    pub fn new(
        config: &Config,
        outbound: Arc<dyn CommandSink>,
        scheduler: Arc<Scheduler>,
        status: Arc<StatusBoard>,
    ) -> Result<Self> {
        let registry = ValueRegistry::new();
        let tracking = &config.tracking;

        let on_update_scene = AsyncEvent::new("session.scene");
        let on_update_label = AsyncEvent::new("session.label");
        let on_update_color = AsyncEvent::new("session.color");
        let on_update_mute = AsyncEvent::new("session.mute");
        let on_update_level = AsyncEvent::new("session.level");
        let on_update_send_level = AsyncEvent::new("session.send_level");
        let on_update_select = AsyncEvent::new("session.select");
        #[cfg(feature = "s-dca")]
        let on_update_s_dca = AsyncEvent::new("session.s_dca");

        let scene: TrackedValue<Scene> = TrackedValue::new(&registry);
        {
            let event = on_update_scene.clone();
            scene
                .on_update_idle()
                .subscribe(move |value| event.emit(*value));
        }

        let mut channels: HashMap<ChannelIdentifier, ChannelState> = HashMap::new();
        let mut ordering = Vec::new();

        let mut register = |ch: ChannelIdentifier, kind: ChannelKind, quiet: bool| -> Result<()> {
            let label: TrackedValue<Label> = TrackedValue::new(&registry);
            let color: TrackedValue<Color> = TrackedValue::immediate(&registry);
            let mute: TrackedValue<bool> = TrackedValue::new(&registry);
            let level: TrackedValue<Level> = TrackedValue::new(&registry);
            let select: TrackedValue<bool> = TrackedValue::immediate(&registry);

            {
                let event = on_update_mute.clone();
                mute.on_update_idle()
                    .subscribe(move |value| event.emit((ch, *value)));
            }
            {
                let event = on_update_level.clone();
                level
                    .on_update_idle()
                    .subscribe(move |value| event.emit((ch, *value)));
            }
            {
                let event = on_update_select.clone();
                select
                    .on_update_idle()
                    .subscribe(move |value| event.emit((ch, *value)));
            }

            // fader strips keep their label/color bookkeeping out of the UI
            if !quiet {
                let event = on_update_label.clone();
                label
                    .on_update_idle()
                    .subscribe(move |value| event.emit((ch, value.clone())));

                let event = on_update_color.clone();
                color
                    .on_update_idle()
                    .subscribe(move |value| event.emit((ch, *value)));
            }

            let state = ChannelState {
                label,
                color,
                mute,
                level,
                select,
                kind,
            };

            if channels.insert(ch, state).is_some() {
                return Err(SurfaceError::Config(format!(
                    "overlapping channel ranges: {} configured twice",
                    ch.short_label()
                )));
            }
            ordering.push(ch);
            Ok(())
        };

        let mut send_channels = Vec::new();
        let mut aux_channels = Vec::new();
        let mut fx_channels = Vec::new();
        let mut external_fx_channels = Vec::new();

        for index in tracking.mono_aux_start..tracking.mono_aux_start + tracking.mono_aux {
            let ch = ChannelIdentifier::new(Bank::MonoAux, index);
            register(ch, ChannelKind::Multi, false)?;
            send_channels.push(ch);
            aux_channels.push(ch);
        }

        // the external FX block lives in the mono aux bank
        for index in tracking.external_fx_start..tracking.external_fx_start + tracking.external_fx {
            let ch = ChannelIdentifier::new(Bank::MonoAux, index);
            register(ch, ChannelKind::Multi, false)?;
            send_channels.push(ch);
            external_fx_channels.push(ch);
        }

        for index in 0..tracking.stereo_aux {
            let ch = ChannelIdentifier::new(Bank::StereoAux, index);
            register(ch, ChannelKind::Multi, false)?;
            send_channels.push(ch);
            aux_channels.push(ch);
        }

        for index in 0..tracking.mono_fx {
            let ch = ChannelIdentifier::new(Bank::MonoFxSend, index);
            register(ch, ChannelKind::Multi, false)?;
            send_channels.push(ch);
            fx_channels.push(ch);
        }

        for index in 0..tracking.stereo_fx {
            let ch = ChannelIdentifier::new(Bank::StereoFxSend, index);
            register(ch, ChannelKind::Multi, false)?;
            send_channels.push(ch);
            fx_channels.push(ch);
        }

        let mut input_channels = Vec::new();
        for index in 0..tracking.inputs {
            let ch = ChannelIdentifier::new(Bank::Input, index);
            register(ch, ChannelKind::Input(SendStore::new()), false)?;
            input_channels.push(ch);
        }

        let mut fx_return_channels = Vec::new();
        for index in 0..tracking.fx_returns {
            let ch = ChannelIdentifier::new(Bank::FxReturn, index);
            register(ch, ChannelKind::Input(SendStore::new()), false)?;
            fx_return_channels.push(ch);
        }

        let mut virtual_channels = Vec::new();
        for index in tracking.virtual_start..tracking.virtual_start + 16 {
            let ch = ChannelIdentifier::new(Bank::Input, index);
            register(ch, ChannelKind::Virtual, true)?;
            virtual_channels.push(ch);
        }

        let virtual_feedback = ChannelIdentifier::new(Bank::MonoMatrix, tracking.feedback_matrix);
        register(virtual_feedback, ChannelKind::Output, false)?;

        let talk_to_stage = input_channels[tracking.talk_to_stage as usize];
        let talk_to_monitor = input_channels[tracking.talk_to_monitor as usize];

        Ok(Self {
            registry,
            encoder: Encoder::new(config.mixrack.bank_offset),
            decoder_shared: Arc::new(DecoderShared::new()),
            outbound,
            scheduler,
            status,
            timing: config.timing,
            scenes: config.scenes,
            bank_offset: config.mixrack.bank_offset,
            scene,
            feedback_source: Mutex::new(None),
            channels,
            ordering,
            input_channels,
            fx_return_channels,
            send_channels,
            aux_channels,
            fx_channels,
            external_fx_channels,
            virtual_channels,
            virtual_feedback,
            talk_to_stage,
            talk_to_monitor,
            listening: AtomicBool::new(false),
            syncing: AtomicBool::new(false),
            on_update_scene,
            on_update_label,
            on_update_color,
            on_update_mute,
            on_update_level,
            on_update_send_level,
            on_update_select,
            #[cfg(feature = "s-dca")]
            on_update_s_dca,
        })
    }

    // --- topology accessors ---

    /// Input channels, in canonical order
    pub fn input_channels(&self) -> &[ChannelIdentifier] {
        &self.input_channels
    }

    /// FX return channels
    pub fn fx_return_channels(&self) -> &[ChannelIdentifier] {
        &self.fx_return_channels
    }

    /// All send destinations (aux, external FX, FX)
    pub fn send_channels(&self) -> &[ChannelIdentifier] {
        &self.send_channels
    }

    /// Aux buses
    pub fn aux_channels(&self) -> &[ChannelIdentifier] {
        &self.aux_channels
    }

    /// FX buses
    pub fn fx_channels(&self) -> &[ChannelIdentifier] {
        &self.fx_channels
    }

    /// External FX buses (hosted in the mono aux bank)
    pub fn external_fx_channels(&self) -> &[ChannelIdentifier] {
        &self.external_fx_channels
    }

    /// The 16 fader strip channels
    pub fn virtual_channels(&self) -> &[ChannelIdentifier] {
        &self.virtual_channels
    }

    /// The matrix bus used for in-ear feedback monitoring
    pub fn virtual_feedback_channel(&self) -> ChannelIdentifier {
        self.virtual_feedback
    }

    /// Input wired to the stage talkback microphone
    pub fn talk_to_stage_channel(&self) -> ChannelIdentifier {
        self.talk_to_stage
    }

    /// Input wired to the monitor talkback microphone
    pub fn talk_to_monitor_channel(&self) -> ChannelIdentifier {
        self.talk_to_monitor
    }

    /// The scene map from configuration
    pub fn scenes(&self) -> &SceneConfig {
        &self.scenes
    }

    /// The status board shared with the UI
    pub fn status(&self) -> &Arc<StatusBoard> {
        &self.status
    }

    /// The scheduler shared with the UI
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    // --- events ---

    /// Scene recalls observed on the wire
    pub fn on_update_scene(&self) -> &AsyncEvent<Scene> {
        &self.on_update_scene
    }

    /// Label updates
    pub fn on_update_label(&self) -> &AsyncEvent<(ChannelIdentifier, Label)> {
        &self.on_update_label
    }

    /// Color updates
    pub fn on_update_color(&self) -> &AsyncEvent<(ChannelIdentifier, Color)> {
        &self.on_update_color
    }

    /// Mute updates
    pub fn on_update_mute(&self) -> &AsyncEvent<(ChannelIdentifier, bool)> {
        &self.on_update_mute
    }

    /// Fader level updates
    pub fn on_update_level(&self) -> &AsyncEvent<(ChannelIdentifier, Level)> {
        &self.on_update_level
    }

    /// Send level updates
    pub fn on_update_send_level(&self) -> &AsyncEvent<(ChannelIdentifier, ChannelIdentifier, Level)> {
        &self.on_update_send_level
    }

    /// Selection updates
    pub fn on_update_select(&self) -> &AsyncEvent<(ChannelIdentifier, bool)> {
        &self.on_update_select
    }

    /// S-DCA affectedness updates
    #[cfg(feature = "s-dca")]
    pub fn on_update_s_dca(&self) -> &AsyncEvent<(ChannelIdentifier, bool)> {
        &self.on_update_s_dca
    }

    // --- getters (with UI-friendly fallbacks) ---

    /// Current scene; scene 0 before the first resolve
    pub fn get_scene(&self) -> Scene {
        self.scene.value().unwrap_or_default()
    }

    /// Channel label; empty before the first resolve
    pub fn get_label(&self, channel: ChannelIdentifier) -> Label {
        self.channels
            .get(&channel)
            .and_then(|state| state.label.value())
            .unwrap_or_default()
    }

    /// Channel color; `Off` before the first resolve
    pub fn get_color(&self, channel: ChannelIdentifier) -> Color {
        self.channels
            .get(&channel)
            .and_then(|state| state.color.value())
            .unwrap_or_default()
    }

    /// Channel mute; unmuted before the first resolve
    pub fn get_mute(&self, channel: ChannelIdentifier) -> bool {
        self.channels
            .get(&channel)
            .and_then(|state| state.mute.value())
            .unwrap_or(false)
    }

    /// Channel level; `OFF` before the first resolve
    pub fn get_level(&self, channel: ChannelIdentifier) -> Level {
        self.channels
            .get(&channel)
            .and_then(|state| state.level.value())
            .unwrap_or(Level::OFF)
    }

    /// Send level with fallback `OFF`
    pub fn get_send_level(&self, from: ChannelIdentifier, to: ChannelIdentifier) -> Level {
        self.get_send_level_opt(from, to).unwrap_or(Level::OFF)
    }

    /// Send level, `None` while unresolved. Reading allocates the send map.
    pub fn get_send_level_opt(
        &self,
        from: ChannelIdentifier,
        to: ChannelIdentifier,
    ) -> Option<Level> {
        self.send_cell(from, to)?.value()
    }

    /// Whether a channel is currently selected
    pub fn is_selected(&self, channel: ChannelIdentifier) -> bool {
        self.channels
            .get(&channel)
            .and_then(|state| state.select.value())
            .unwrap_or(false)
    }

    /// Inputs currently selected (the S-DCA working set)
    pub fn selected_inputs(&self) -> Vec<ChannelIdentifier> {
        self.input_channels
            .iter()
            .copied()
            .filter(|&ch| self.is_selected(ch))
            .collect()
    }

    // --- change operations (queue first, then transmit) ---

    /// Recall a scene by validated number.
    pub fn change_scene_number(&self, number: u16) -> Result<()> {
        self.change_scene(Scene::checked(number)?)
    }

    /// Recall a scene.
    pub fn change_scene(&self, scene: Scene) -> Result<()> {
        if self.scene.request(scene).1 {
            self.send(&self.encoder.recall_scene(scene))?;
        }
        Ok(())
    }

    /// Set a channel label.
    pub fn change_label(&self, channel: ChannelIdentifier, label: Label) -> Result<()> {
        let state = self.channel(channel)?;
        if state.label.request(label.clone()).1 {
            self.send(&self.encoder.label(channel, &label))?;
        }
        Ok(())
    }

    /// Set a channel color.
    pub fn change_color(&self, channel: ChannelIdentifier, color: Color) -> Result<()> {
        let state = self.channel(channel)?;
        if state.color.request(color).1 {
            self.send(&self.encoder.color(channel, color))?;
        }
        Ok(())
    }

    /// Set a channel mute state.
    pub fn change_mute(&self, channel: ChannelIdentifier, mute: bool) -> Result<()> {
        let state = self.channel(channel)?;
        if state.mute.request(mute).1 {
            self.send(&self.encoder.mute(channel, mute))?;
        }
        Ok(())
    }

    /// Set a channel fader level.
    pub fn change_level(&self, channel: ChannelIdentifier, level: Level) -> Result<()> {
        let state = self.channel(channel)?;
        if state.level.request(level).1 {
            self.send(&self.encoder.level(channel, level))?;
        }
        Ok(())
    }

    /// Set a send level.
    pub fn change_send_level(
        &self,
        from: ChannelIdentifier,
        to: ChannelIdentifier,
        level: Level,
    ) -> Result<()> {
        let cell = self.send_cell(from, to).ok_or_else(|| {
            SurfaceError::Range(format!(
                "no tracked send level {} -> {}",
                from.short_label(),
                to.short_label()
            ))
        })?;

        if cell.request(level).1 {
            self.send(&self.encoder.send_level(from, to, level))?;
        }
        Ok(())
    }

    /// Mark a channel as selected or deselected.
    pub fn set_selected(&self, channel: ChannelIdentifier, selected: bool) -> Result<()> {
        self.channel(channel)?.select.request(selected);
        Ok(())
    }

    /// Select at most one channel, deselecting every other.
    pub fn select_exclusively(&self, target: Option<ChannelIdentifier>) {
        for &ch in &self.ordering {
            // the ordering only holds registered channels
            let _ = self.set_selected(ch, Some(ch) == target);
        }
    }

    /// Route every send channel's feed to the feedback bus: `ZERO_DB` for
    /// the given channel, `OFF` for all others. These writes are
    /// deliberately untracked; the console's echoes are ignored.
    pub fn change_feedback_source(&self, channel: Option<ChannelIdentifier>) -> Result<()> {
        if let Some(ch) = channel {
            if !self.send_channels.contains(&ch) {
                return Err(SurfaceError::Range(format!(
                    "{} is not a valid send channel",
                    ch.short_label()
                )));
            }
        }

        *self.feedback_source.lock() = channel;

        for &send_channel in &self.send_channels {
            let level = if channel == Some(send_channel) {
                Level::ZERO_DB
            } else {
                Level::OFF
            };
            self.send(
                &self
                    .encoder
                    .send_level(send_channel, self.virtual_feedback, level),
            )?;
        }

        Ok(())
    }

    // --- S-DCA bookkeeping ---

    /// Snapshot the channel's resolved send levels.
    #[cfg(feature = "s-dca")]
    pub fn backup_sends(&self, channel: ChannelIdentifier) {
        let Some(store) = self.channels.get(&channel).and_then(|s| s.send_store()) else {
            return;
        };

        let map = store.map.lock();
        let Some(map) = map.as_ref() else { return };

        let mut snapshot = store.snapshot.lock();
        snapshot.clear();
        for (&dest, cell) in map {
            if let Some(level) = cell.value() {
                snapshot.insert(dest, level);
            }
        }
    }

    /// Revert every affected send of the channel to its snapshot and clear
    /// the affected set.
    #[cfg(feature = "s-dca")]
    pub fn restore_sends(&self, channel: ChannelIdentifier) -> Result<()> {
        let Some(store) = self.channels.get(&channel).and_then(|s| s.send_store()) else {
            return Ok(());
        };

        let snapshot: Vec<(ChannelIdentifier, Level)> = {
            let snapshot = store.snapshot.lock();
            if snapshot.is_empty() {
                self.status
                    .set_status(format!("Restore fail | {}", channel.short_label()));
                return Ok(());
            }
            snapshot.iter().map(|(&dest, &level)| (dest, level)).collect()
        };

        let affected: HashSet<ChannelIdentifier> = store.affected.lock().drain().collect();

        for (dest, level) in snapshot {
            if affected.contains(&dest) && self.get_send_level_opt(channel, dest) != Some(level) {
                self.change_send_level(channel, dest, level)?;
            }
        }

        self.on_update_s_dca.emit((channel, false));
        Ok(())
    }

    /// Accept the current send levels: drop the snapshot and clear the
    /// affected set.
    #[cfg(feature = "s-dca")]
    pub fn drop_sends_backup(&self, channel: ChannelIdentifier) {
        let Some(store) = self.channels.get(&channel).and_then(|s| s.send_store()) else {
            return;
        };

        store.snapshot.lock().clear();
        store.affected.lock().clear();
        self.on_update_s_dca.emit((channel, false));
    }

    /// Record that a send of this channel was moved by the S-DCA strip.
    #[cfg(feature = "s-dca")]
    pub fn mark_s_dca_affected(&self, channel: ChannelIdentifier, dest: ChannelIdentifier) {
        let Some(store) = self.channels.get(&channel).and_then(|s| s.send_store()) else {
            return;
        };

        if store.affected.lock().insert(dest) {
            self.on_update_s_dca.emit((channel, true));
        }
    }

    /// Whether any send of this channel is currently moved by the S-DCA.
    #[cfg(feature = "s-dca")]
    pub fn is_s_dca_affected(&self, channel: ChannelIdentifier) -> bool {
        self.channels
            .get(&channel)
            .and_then(|s| s.send_store())
            .map(|store| !store.affected.lock().is_empty())
            .unwrap_or(false)
    }

    // --- wire plumbing ---

    /// Route one decoded message onto the matching tracked cell.
    ///
    /// Called by the reader threads; public so a frontend (or a test) can
    /// drive the session without sockets.
    pub fn apply_message(&self, message: Message) {
        match message {
            Message::Scene(scene) => {
                self.scene.resolve(scene);
            }
            Message::Label(ch, label) => {
                if let Some(state) = self.channels.get(&ch) {
                    state.label.resolve(label);
                }
            }
            Message::Color(ch, color) => {
                if let Some(state) = self.channels.get(&ch) {
                    state.color.resolve(color);
                }
            }
            Message::Mute(ch, mute) => {
                if let Some(state) = self.channels.get(&ch) {
                    state.mute.resolve(mute);
                }
            }
            Message::Level(ch, level) => {
                if let Some(state) = self.channels.get(&ch) {
                    state.level.resolve(level);
                }
            }
            Message::SendLevel { from, to, level } => {
                if let Some(cell) = self.send_cell(from, to) {
                    cell.resolve(level);
                }
            }
            Message::UnknownSysex { data, reason } => {
                tracing::debug!(?data, %reason, "unintelligible sysex");
            }
        }
    }

    /// Spawn one reader thread per transport port.
    ///
    /// Each reader owns its own decoder window (the two streams must not
    /// interleave) sharing the quirks flag and the quiescence clock. Also
    /// installs the stale-request sweeper.
    pub fn listen(self: &Arc<Self>, readers: Vec<PortReader>) {
        if self.listening.swap(true, Ordering::SeqCst) {
            return;
        }

        for (index, mut reader) in readers.into_iter().enumerate() {
            let session = Arc::downgrade(self);
            let decoder = Decoder::new(self.bank_offset, Arc::clone(&self.decoder_shared));

            thread::Builder::new()
                .name(format!("mixrack-reader-{index}"))
                .spawn(move || loop {
                    match reader.next_message() {
                        Ok(raw) => {
                            let Some(session) = session.upgrade() else { break };
                            if let Some(message) = decoder.feed(raw) {
                                session.apply_message(message);
                            }
                        }
                        Err(error) => {
                            tracing::error!(%error, "reader stopped");
                            if let Some(session) = session.upgrade() {
                                session.status.set_status("Connection lost");
                            }
                            break;
                        }
                    }
                })
                .expect("failed to spawn reader thread");
        }

        let weak = Arc::downgrade(self);
        let max_age = self.timing.purge_max_age;
        self.scheduler.execute_interval(
            "purge_stale_requests",
            self.timing.purge_interval,
            move || {
                if let Some(session) = weak.upgrade() {
                    let purged = session.registry.purge_all(max_age);
                    if purged > 0 {
                        session
                            .status
                            .notify(format!("Purged {purged} stale requests"));
                    }
                }
            },
        );
    }

    /// The startup dance bringing the local mirror into agreement with the
    /// console. Restartable; a second call while one is running is rejected.
    pub fn sync(self: &Arc<Self>) -> Result<()> {
        if self.syncing.swap(true, Ordering::SeqCst) {
            return Err(SurfaceError::Other("sync is already running".into()));
        }

        let result = self.sync_inner();
        self.syncing.store(false, Ordering::SeqCst);
        result
    }

    fn sync_inner(self: &Arc<Self>) -> Result<()> {
        self.status.set_status("Syncing…");

        // 1: let the inbound stream drain
        self.wait_until_settled(false);

        // 2 + 3: a defined scene and a silent feedback matrix
        self.change_scene(self.scenes.mixing_start)?;
        self.change_feedback_source(None)?;

        // 4: mutes and labels inside the quirks window; a mirrored mute
        // request is byte-identical to a colour report for channel 9, labels
        // do not collide
        self.decoder_shared.set_quirks_mode(true);

        for &ch in &self.ordering {
            self.send(&self.encoder.request_mute(ch))?;
            thread::sleep(self.timing.channel_grace);
        }
        for &ch in &self.ordering {
            self.send(&self.encoder.request_label(ch))?;
            thread::sleep(self.timing.channel_grace);
        }

        self.wait_until_settled(true);
        self.decoder_shared.set_quirks_mode(false);

        // 5: everything that cannot collide
        for &ch in &self.ordering {
            self.send(&self.encoder.request_color(ch))?;
            thread::sleep(self.timing.channel_grace);
        }
        for &ch in &self.ordering {
            self.send(&self.encoder.request_level(ch))?;
            thread::sleep(self.timing.channel_grace);
        }

        self.wait_until_settled(true);

        // 6: the console never pushes colour changes, poll them
        let weak = Arc::downgrade(self);
        self.scheduler
            .execute_interval("poll_color_updates", self.timing.color_poll, move || {
                if let Some(session) = weak.upgrade() {
                    session.poll_colors();
                }
            });

        // deferred send-map hydration, one channel at a time
        let weak = Arc::downgrade(self);
        self.scheduler
            .execute_delayed("hydrate_sends", self.timing.hydration_delay, move || {
                if let Some(session) = weak.upgrade() {
                    session.hydrate_all_sends();
                }
            });

        Ok(())
    }

    fn poll_colors(&self) {
        for &ch in &self.ordering {
            if let Some(state) = self.channels.get(&ch) {
                if matches!(state.kind, ChannelKind::Virtual) {
                    continue;
                }
            }
            if self.send(&self.encoder.request_color(ch)).is_err() {
                return;
            }
        }
    }

    fn hydrate_all_sends(&self) {
        self.status.set_status("Hydrating…");

        let input_like: Vec<ChannelIdentifier> = self
            .input_channels
            .iter()
            .chain(self.fx_return_channels.iter())
            .copied()
            .collect();

        for ch in input_like {
            match self.hydrate_sends(ch) {
                Ok(true) => thread::sleep(self.timing.hydration_grace),
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(%error, channel = %ch.short_label(), "hydration failed");
                    return;
                }
            }
        }

        self.status.set_status("Fully hydrated");
    }

    /// Allocate the channel's send map and request every level once.
    ///
    /// Returns whether this call performed the hydration.
    pub fn hydrate_sends(&self, channel: ChannelIdentifier) -> Result<bool> {
        let state = self.channel(channel)?;
        let Some(store) = state.send_store() else {
            return Err(SurfaceError::Range(format!(
                "{} has no send levels",
                channel.short_label()
            )));
        };

        self.ensure_send_map(channel, store);

        if store.hydrated.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        tracing::debug!(channel = %channel.short_label(), "hydrating sends");
        for &dest in &self.send_channels {
            self.send(&self.encoder.request_send_level(channel, dest))?;
        }

        Ok(true)
    }

    /// Block until the inbound stream has been quiet for 0.8 s.
    pub fn wait_until_settled(&self, wait_initial: bool) {
        if wait_initial {
            thread::sleep(Duration::from_secs(1));
        }

        while !self.decoder_shared.settled() {
            thread::sleep(Duration::from_millis(100));
        }
    }

    /// Shared decoder state (quirks flag + quiescence clock)
    pub fn decoder_shared(&self) -> Arc<DecoderShared> {
        Arc::clone(&self.decoder_shared)
    }

    /// Human-readable overview of the whole mirror, for the REPL.
    pub fn dump(&self) -> String {
        let feedback = *self.feedback_source.lock();

        let mut out = String::from("Session {\n");
        out.push_str(&format!("  scene:           {}\n", self.get_scene()));
        out.push_str(&format!(
            "  feedback source: {}\n\n",
            feedback
                .map(|ch| ch.short_label())
                .unwrap_or_else(|| "-".into())
        ));

        out.push_str(&format!(
            "  {:<9} {:<9} {:<10} {:<5} {:<5} sends\n",
            "channel", "label", "color", "mute", "level"
        ));

        for &ch in &self.ordering {
            let Some(state) = self.channels.get(&ch) else {
                continue;
            };

            let mut sends = Vec::new();
            if let Some(store) = state.send_store() {
                if let Some(map) = store.map.lock().as_ref() {
                    for &dest in &self.send_channels {
                        if let Some(level) = map.get(&dest).and_then(|cell| cell.value()) {
                            if level != Level::OFF {
                                sends.push(format!("{}@{}", dest.short_label(), level));
                            }
                        }
                    }
                }
            }

            out.push_str(&format!(
                "  {:<9} {:<9} {:<10} {:<5} {:<5} {}\n",
                ch.short_label(),
                state
                    .label
                    .value()
                    .map(|label| label.to_string())
                    .unwrap_or_else(|| "?".into()),
                state
                    .color
                    .value()
                    .map(|color| color.to_string())
                    .unwrap_or_else(|| "?".into()),
                state
                    .mute
                    .value()
                    .map(|mute| if mute { "on" } else { "off" }.to_string())
                    .unwrap_or_else(|| "?".into()),
                state
                    .level
                    .value()
                    .map(|level| level.to_string())
                    .unwrap_or_else(|| "?".into()),
                sends.join(", "),
            ));
        }

        out.push_str("}\n");
        out
    }

    // --- internals ---

    fn channel(&self, channel: ChannelIdentifier) -> Result<&ChannelState> {
        self.channels.get(&channel).ok_or_else(|| {
            SurfaceError::Range(format!(
                "{} is not in the configured channel set",
                channel.short_label()
            ))
        })
    }

    fn send(&self, bytes: &[u8]) -> Result<()> {
        self.outbound.send_bytes(bytes).map(|_| ())
    }

    fn send_cell(
        &self,
        from: ChannelIdentifier,
        to: ChannelIdentifier,
    ) -> Option<TrackedValue<Level>> {
        let store = self.channels.get(&from)?.send_store()?;
        self.ensure_send_map(from, store);

        let map = store.map.lock();
        map.as_ref()?.get(&to).cloned()
    }

    /// Allocate the per-destination cells on first use.
    fn ensure_send_map(&self, channel: ChannelIdentifier, store: &SendStore) {
        let mut map = store.map.lock();
        if map.is_some() {
            return;
        }

        let mut cells = HashMap::with_capacity(self.send_channels.len());
        for &dest in &self.send_channels {
            let cell: TrackedValue<Level> = TrackedValue::new(&self.registry);
            let event = self.on_update_send_level.clone();
            cell.on_update_idle()
                .subscribe(move |level| event.emit((channel, dest, *level)));
            cells.insert(dest, cell);
        }

        *map = Some(cells);
    }
}


#[cfg(test)]
mod tests {
    use super::testing::session;
    use super::*;
    use pretty_assertions::assert_eq;

    fn input(index: u8) -> ChannelIdentifier {
        ChannelIdentifier::new(Bank::Input, index)
    }

    fn aux(index: u8) -> ChannelIdentifier {
        ChannelIdentifier::new(Bank::MonoAux, index)
    }

    #[test]
    fn topology_matches_configuration() {
        let (session, _) = session();

        assert_eq!(session.input_channels().len(), 24);
        assert_eq!(session.fx_return_channels().len(), 2);
        // 4 mono aux + 2 external fx + 2 stereo aux + 2 mono fx + 1 stereo fx
        assert_eq!(session.send_channels().len(), 11);
        assert_eq!(session.aux_channels().len(), 6);
        assert_eq!(session.fx_channels().len(), 3);
        assert_eq!(session.external_fx_channels().len(), 2);
        assert_eq!(session.virtual_channels().len(), 16);

        assert_eq!(session.talk_to_stage_channel(), input(22));
        assert_eq!(session.talk_to_monitor_channel(), input(23));
        assert_eq!(
            session.virtual_feedback_channel(),
            ChannelIdentifier::new(Bank::MonoMatrix, 10)
        );
    }

    #[test]
    fn overlapping_ranges_are_a_config_error() {
        let broken = testing::CONFIG.replace("external_fx_start = 7", "external_fx_start = 4");
        let config = Config::from_toml(&broken).unwrap();

        let result = Session::new(
            &config,
            testing::RecordingSink::new() as Arc<dyn CommandSink>,
            Arc::new(Scheduler::new(1)),
            Arc::new(StatusBoard::new()),
        );

        assert!(matches!(result, Err(SurfaceError::Config(_))));
    }

    #[test]
    fn resolved_send_level_is_readable() {
        let (session, _) = session();

        session.apply_message(Message::SendLevel {
            from: input(0),
            to: aux(0),
            level: Level::ZERO_DB,
        });

        assert_eq!(session.get_send_level_opt(input(0), aux(0)), Some(Level::ZERO_DB));
        assert_eq!(session.get_send_level(input(0), aux(0)), Level::ZERO_DB);
    }

    #[test]
    fn resolves_route_to_the_right_cells() {
        let (session, _) = session();

        session.apply_message(Message::Label(input(3), Label::new("Kick")));
        session.apply_message(Message::Mute(input(3), true));
        session.apply_message(Message::Level(input(3), Level::FULL));
        session.apply_message(Message::Color(input(3), Color::Red));

        assert_eq!(session.get_label(input(3)).as_str(), "Kick");
        assert!(session.get_mute(input(3)));
        assert_eq!(session.get_level(input(3)), Level::FULL);
        assert_eq!(session.get_color(input(3)), Color::Red);

        // neighbours untouched
        assert!(!session.get_mute(input(4)));
    }

    #[test]
    fn change_mute_queues_then_transmits_once() {
        let (session, sink) = session();

        session.change_mute(input(0), true).unwrap();
        session.change_mute(input(0), true).unwrap();

        // B = 1 shifts the note-on status byte
        assert_eq!(sink.writes(), vec![vec![0x91, 0x00, 0x7F, 0x00, 0x00]]);
    }

    #[test]
    fn change_for_unknown_channel_is_a_range_error() {
        let (session, _) = session();
        let stranger = ChannelIdentifier::new(Bank::Dca, 0);

        assert!(matches!(
            session.change_mute(stranger, true),
            Err(SurfaceError::Range(_))
        ));
    }

    #[test]
    fn change_scene_validates_range() {
        let (session, sink) = session();

        assert!(session.change_scene_number(500).is_err());
        assert!(sink.writes().is_empty());

        session.change_scene_number(100).unwrap();
        assert_eq!(sink.writes(), vec![vec![0xB1, 0x00, 0x00, 0xC1, 0x64]]);
    }

    #[test]
    fn echo_resolves_the_queued_request() {
        let (session, _) = session();

        session.change_level(input(1), Level::ZERO_DB).unwrap();
        session.apply_message(Message::Level(input(1), Level::ZERO_DB));

        assert_eq!(session.get_level(input(1)), Level::ZERO_DB);
    }

    #[test]
    fn feedback_fanout_hits_every_send_channel() {
        let (session, sink) = session();
        let target = session.aux_channels()[1];

        session.change_feedback_source(Some(target)).unwrap();

        let writes = sink.writes();
        assert_eq!(writes.len(), session.send_channels().len());

        // exactly one write carries ZERO_DB
        let zero_db = writes
            .iter()
            .filter(|bytes| bytes[bytes.len() - 2] == Level::ZERO_DB.value())
            .count();
        assert_eq!(zero_db, 1);
    }

    #[test]
    fn feedback_source_must_be_a_send_channel() {
        let (session, _) = session();
        assert!(session.change_feedback_source(Some(input(0))).is_err());
    }

    #[test]
    fn hydration_requests_every_destination_once() {
        let (session, sink) = session();

        assert!(session.hydrate_sends(input(0)).unwrap());
        assert_eq!(sink.writes().len(), session.send_channels().len());

        sink.clear();
        assert!(!session.hydrate_sends(input(0)).unwrap());
        assert!(sink.writes().is_empty());
    }

    #[test]
    fn selection_is_exclusive() {
        let (session, _) = session();

        session.set_selected(input(2), true).unwrap();
        session.select_exclusively(Some(input(5)));

        assert!(!session.is_selected(input(2)));
        assert!(session.is_selected(input(5)));
        assert_eq!(session.selected_inputs(), vec![input(5)]);
    }

    #[test]
    fn dump_renders_every_channel() {
        let (session, _) = session();
        session.apply_message(Message::Label(input(0), Label::new("Kick")));

        let dump = session.dump();
        assert!(dump.contains("Kick"));
        assert!(dump.contains("Ip 1"));
        assert!(dump.contains("scene:"));
    }

    #[cfg(feature = "s-dca")]
    #[test]
    fn backup_restore_cycle() {
        let (session, _) = session();

        session.apply_message(Message::SendLevel {
            from: input(0),
            to: aux(0),
            level: Level::ZERO_DB,
        });

        session.backup_sends(input(0));
        session.mark_s_dca_affected(input(0), aux(0));
        assert!(session.is_s_dca_affected(input(0)));

        // the strip moved the send away
        session.change_send_level(input(0), aux(0), Level::FULL).unwrap();
        session.apply_message(Message::SendLevel {
            from: input(0),
            to: aux(0),
            level: Level::FULL,
        });

        session.restore_sends(input(0)).unwrap();
        assert!(!session.is_s_dca_affected(input(0)));

        // the restore request is pending; the echo completes it
        session.apply_message(Message::SendLevel {
            from: input(0),
            to: aux(0),
            level: Level::ZERO_DB,
        });
        assert_eq!(session.get_send_level(input(0), aux(0)), Level::ZERO_DB);
    }

    #[cfg(feature = "s-dca")]
    #[test]
    fn restore_without_backup_reports_failure() {
        let (session, _) = session();
        session.restore_sends(input(1)).unwrap();
        assert!(session.status().status().contains("Restore fail"));
    }

    #[test]
    fn second_sync_while_running_is_rejected() {
        let (session, _) = session();

        // emulate a running sync
        session.syncing.store(true, Ordering::SeqCst);
        assert!(session.sync().is_err());
    }
}
