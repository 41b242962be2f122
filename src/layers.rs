//! Scene-driven layer state machine
//!
//! The console's own scene recall is the source of truth for "which layer is
//! loaded": every UI command that switches layers recalls a scene from the
//! configured map, and the state machine reacts to the scene number coming
//! back on the wire. A no-op recall is never echoed, so commands that land
//! on the already-current scene trigger the transition handler directly.
//!
//! The OUTPUTS window carries a firmware workaround: after configuring the
//! left fader bank, the right-side pairing scene is recalled so the
//! console's bank indicator LEDs stay consistent.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::SceneConfig;
use crate::entity::{ChannelIdentifier, Level, Scene};
use crate::event::AsyncEvent;
use crate::session::Session;
use crate::strip::VirtualStrip;

/// Logical layer the surface is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerMode {
    /// Plain mixing banks
    Mixing,
    /// One input's sends spread over the faders
    SendsOnFader,
    /// One output's mix spread over the faders
    Outputs,
    /// Relative group fader over selected inputs
    #[cfg(feature = "s-dca")]
    SDca,
    /// Custom aux layer
    CustomAux,
    /// Custom FX layer
    CustomFx,
    /// Custom utility layer
    CustomUtil,
}

/// Where SENDS_ON_FADER points its destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendsTarget {
    /// Aux buses
    Aux,
    /// FX and external FX buses
    Fx,
}

/// What to rebuild when a modifier flips.
#[derive(Debug, Clone, Copy)]
enum Reconfigure {
    None,
    Outputs(ChannelIdentifier),
    Sends(ChannelIdentifier),
    #[cfg(feature = "s-dca")]
    SDca,
}

struct ControllerState {
    mode: LayerMode,
    bank: u8,
    channel_filter: bool,
    sends_target: SendsTarget,
    last_output: ChannelIdentifier,
    last_input: ChannelIdentifier,
    selected: Option<ChannelIdentifier>,
    reconfigure: Reconfigure,
    #[cfg(feature = "s-dca")]
    s_dca_requested: bool,
    #[cfg(feature = "s-dca")]
    s_dca_active: bool,
}

/// Consistent picture of the controller for the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionSnapshot {
    /// Current layer
    pub mode: LayerMode,
    /// Current bank (0..5)
    pub bank: u8,
    /// Whether the channel filter is active
    pub channel_filter: bool,
    /// Destination family for sends-on-fader
    pub sends_target: SendsTarget,
    /// The selected channel, if any
    pub selected: Option<ChannelIdentifier>,
    /// Whether an S-DCA session holds snapshots
    #[cfg(feature = "s-dca")]
    pub s_dca_active: bool,
}

/// The deterministic mode state machine driving the 16 strips.
pub struct LayerController {
    session: Arc<Session>,
    scenes: SceneConfig,
    strips: Vec<Arc<VirtualStrip>>,
    state: Mutex<ControllerState>,
    on_mode_changed: AsyncEvent<LayerMode>,
    on_selection_changed: AsyncEvent<Option<ChannelIdentifier>>,
    on_modifier_changed: AsyncEvent<(&'static str, bool)>,
}

impl LayerController {
    /// Build the controller, its strips, and subscribe to scene recalls.
    pub fn new(session: &Arc<Session>) -> Arc<Self> {
        let strips: Vec<Arc<VirtualStrip>> = session
            .virtual_channels()
            .iter()
            .map(|&ch| VirtualStrip::new(session, ch))
            .collect();

        let controller = Arc::new(Self {
            session: Arc::clone(session),
            scenes: *session.scenes(),
            strips,
            state: Mutex::new(ControllerState {
                mode: LayerMode::Mixing,
                bank: 0,
                channel_filter: false,
                sends_target: SendsTarget::Aux,
                last_output: session.send_channels()[0],
                last_input: session.input_channels()[0],
                selected: None,
                reconfigure: Reconfigure::None,
                #[cfg(feature = "s-dca")]
                s_dca_requested: false,
                #[cfg(feature = "s-dca")]
                s_dca_active: false,
            }),
            on_mode_changed: AsyncEvent::new("layer_controller.mode"),
            on_selection_changed: AsyncEvent::new("layer_controller.selection"),
            on_modifier_changed: AsyncEvent::new("layer_controller.modifier"),
        });

        let weak = Arc::downgrade(&controller);
        session.on_update_scene().subscribe(move |scene| {
            if let Some(controller) = weak.upgrade() {
                controller.handle_scene(*scene);
            }
        });

        controller
    }

    /// Fired when the logical mode changes
    pub fn on_mode_changed(&self) -> &AsyncEvent<LayerMode> {
        &self.on_mode_changed
    }

    /// Fired when the selected channel changes
    pub fn on_selection_changed(&self) -> &AsyncEvent<Option<ChannelIdentifier>> {
        &self.on_selection_changed
    }

    /// Fired when a modifier flips, with its name and new state
    pub fn on_modifier_changed(&self) -> &AsyncEvent<(&'static str, bool)> {
        &self.on_modifier_changed
    }

    /// Current mode
    pub fn mode(&self) -> LayerMode {
        self.state.lock().mode
    }

    /// Whether the given channel is the current selection
    pub fn is_selected(&self, channel: ChannelIdentifier) -> bool {
        self.state.lock().selected == Some(channel)
    }

    /// Consistent snapshot for rendering
    pub fn snapshot(&self) -> SelectionSnapshot {
        let state = self.state.lock();
        SelectionSnapshot {
            mode: state.mode,
            bank: state.bank,
            channel_filter: state.channel_filter,
            sends_target: state.sends_target,
            selected: state.selected,
            #[cfg(feature = "s-dca")]
            s_dca_active: state.s_dca_active,
        }
    }

    /// The strips, in fader order
    pub fn strips(&self) -> &[Arc<VirtualStrip>] {
        &self.strips
    }

    // --- UI commands ---

    /// Return to the mixing banks.
    pub fn select_mixing_mode(&self) {
        let scene = {
            let mut state = self.state.lock();
            if state.channel_filter {
                state.channel_filter = false;
                self.on_modifier_changed.emit(("filter", false));
            }
            #[cfg(feature = "s-dca")]
            {
                state.s_dca_requested = false;
            }
            self.scenes.mixing_start.with_offset(state.bank as u16)
        };

        self.recall_or_handle(scene);
    }

    /// Spread the given output's mix over the faders.
    pub fn select_output(&self, output: ChannelIdentifier) {
        let scene = {
            let mut state = self.state.lock();
            state.last_output = output;
            #[cfg(feature = "s-dca")]
            {
                state.s_dca_requested = false;
            }
            self.scenes.virtual_left_start.with_offset(state.bank as u16)
        };

        self.recall_or_handle(scene);
    }

    /// Spread the given input's sends over the faders. In S-DCA mode this
    /// instead toggles the input's membership in the working set.
    pub fn select_input(&self, input: ChannelIdentifier) {
        #[cfg(feature = "s-dca")]
        {
            if self.mode() == LayerMode::SDca {
                self.toggle_s_dca_channel(input);
                return;
            }
        }

        {
            let mut state = self.state.lock();
            state.last_input = input;
        }

        self.recall_or_handle(self.scenes.sends);
    }

    /// Load the custom aux layer.
    pub fn select_custom_aux_mode(&self) {
        self.recall_or_handle(self.scenes.custom_aux);
    }

    /// Load the custom FX layer.
    pub fn select_custom_fx_mode(&self) {
        self.recall_or_handle(self.scenes.custom_fx);
    }

    /// Load the custom utility layer.
    pub fn select_custom_util_mode(&self) {
        self.recall_or_handle(self.scenes.custom_util);
    }

    /// Flip the channel filter and rebuild the current strip layout.
    pub fn toggle_channel_filter(&self) {
        let enabled = {
            let mut state = self.state.lock();
            state.channel_filter = !state.channel_filter;
            state.channel_filter
        };

        self.reapply();
        self.on_modifier_changed.emit(("filter", enabled));
        self.session
            .status()
            .notify(format!("Channel filter -> {}", if enabled { "On" } else { "Off" }));
    }

    /// Flip the sends destination family and rebuild the layout.
    pub fn toggle_sends_target(&self) {
        let target = {
            let mut state = self.state.lock();
            state.sends_target = match state.sends_target {
                SendsTarget::Aux => SendsTarget::Fx,
                SendsTarget::Fx => SendsTarget::Aux,
            };
            state.sends_target
        };

        self.reapply();
        self.on_modifier_changed
            .emit(("sends_target", target == SendsTarget::Fx));
        self.session.status().notify(format!(
            "Sends target -> {}",
            if target == SendsTarget::Fx { "FX" } else { "Aux" }
        ));
    }

    /// Enter or leave the S-DCA layer.
    #[cfg(feature = "s-dca")]
    pub fn toggle_s_dca_mode(&self) {
        if self.mode() == LayerMode::SDca {
            self.select_mixing_mode();
            return;
        }

        {
            let mut state = self.state.lock();
            state.s_dca_requested = true;
            state.s_dca_active = true;
        }

        self.recall_or_handle(self.scenes.sends);
    }

    /// Revert every S-DCA-affected send to its snapshot and leave the layer.
    #[cfg(feature = "s-dca")]
    pub fn clear_s_dca(&self) {
        let was_active = {
            let mut state = self.state.lock();
            std::mem::replace(&mut state.s_dca_active, false)
        };

        if !was_active {
            return;
        }

        for &input in self.session.input_channels() {
            if self.session.is_s_dca_affected(input) {
                if let Err(error) = self.session.restore_sends(input) {
                    tracing::warn!(%error, "S-DCA restore failed");
                }
            }
        }

        for strip in &self.strips {
            strip.tie_to_zero();
        }

        if self.mode() == LayerMode::SDca {
            self.select_mixing_mode();
        } else {
            let selected = self.state.lock().selected;
            self.on_selection_changed.emit(selected);
        }
    }

    /// Keep the current send levels and drop the snapshots.
    #[cfg(feature = "s-dca")]
    pub fn accept_s_dca(&self) {
        {
            let mut state = self.state.lock();
            state.s_dca_active = false;
        }

        for &input in self.session.input_channels() {
            self.session.drop_sends_backup(input);
        }
    }

    // --- scene machine ---

    /// Recall the scene, or run the transition directly when the console is
    /// already there (it will not echo a no-op recall).
    fn recall_or_handle(&self, scene: Scene) {
        if self.session.get_scene() == scene {
            self.handle_scene(scene);
        } else if let Err(error) = self.session.change_scene(scene) {
            tracing::warn!(%error, %scene, "scene recall failed");
        }
    }

    /// React to a scene arriving on the wire.
    fn handle_scene(&self, scene: Scene) {
        let mixing = self.scenes.mixing_start;
        let outputs = self.scenes.virtual_left_start;

        if scene >= mixing && scene < mixing.with_offset(6) {
            self.enter_mixing(scene.value() - mixing.value());
        } else if scene == self.scenes.virtual_right {
            // pairing echo of our own right-side load
        } else if scene >= outputs && scene < outputs.with_offset(6) {
            self.enter_outputs(scene.value() - outputs.value());
        } else if scene == self.scenes.sends {
            self.enter_sends();
        } else if scene == self.scenes.custom_aux {
            self.enter_custom(LayerMode::CustomAux, "Custom | AUX");
        } else if scene == self.scenes.custom_fx {
            self.enter_custom(LayerMode::CustomFx, "Custom | FX");
        } else if scene == self.scenes.custom_util {
            self.enter_custom(LayerMode::CustomUtil, "Custom | UTIL");
        } else {
            // a console scene outside the map; none of our business
            tracing::debug!(%scene, "unmapped scene recall");
        }
    }

    fn enter_mixing(&self, bank: u16) {
        {
            let mut state = self.state.lock();
            self.select_mode(&mut state, LayerMode::Mixing);
            state.bank = bank as u8;
            state.reconfigure = Reconfigure::None;
            self.select_channel(&mut state, None);
        }

        for strip in &self.strips {
            strip.unbind();
        }

        if let Err(error) = self.session.change_feedback_source(None) {
            tracing::warn!(%error, "clearing feedback routing failed");
        }

        self.session
            .status()
            .notify(format!("Mixing | Bank {}", bank + 1));
    }

    fn enter_outputs(&self, bank: u16) {
        let output = {
            let mut state = self.state.lock();
            self.select_mode(&mut state, LayerMode::Outputs);
            state.bank = bank as u8;
            let output = state.last_output;
            self.select_channel(&mut state, Some(output));
            self.configure_outputs(&mut state, output);
            output
        };

        self.session.status().notify(format!(
            "{} | Bank {}",
            output.short_label(),
            bank + 1
        ));

        // pair the right side; works around a firmware quirk where the bank
        // indicator LEDs lose track otherwise
        if self.session.get_scene() != self.scenes.virtual_right {
            if let Err(error) = self.session.change_scene(self.scenes.virtual_right) {
                tracing::warn!(%error, "right-side pairing load failed");
            }
        }
    }

    fn enter_sends(&self) {
        #[cfg(feature = "s-dca")]
        {
            let requested = self.state.lock().s_dca_requested;
            if requested {
                let mut state = self.state.lock();
                self.select_mode(&mut state, LayerMode::SDca);
                self.select_channel(&mut state, None);
                self.configure_s_dca(&mut state);
                drop(state);
                self.session.status().notify("S-DCA");
                return;
            }
        }

        let input = {
            let mut state = self.state.lock();
            self.select_mode(&mut state, LayerMode::SendsOnFader);
            let input = state.last_input;
            self.select_channel(&mut state, Some(input));
            self.configure_sends(&mut state, input);
            input
        };

        self.session
            .status()
            .notify(format!("SendsOnFader | {}", input.short_label()));
    }

    fn enter_custom(&self, mode: LayerMode, message: &str) {
        {
            let mut state = self.state.lock();
            self.select_mode(&mut state, mode);
            state.reconfigure = Reconfigure::None;
            self.select_channel(&mut state, None);
        }

        if let Err(error) = self.session.change_feedback_source(None) {
            tracing::warn!(%error, "clearing feedback routing failed");
        }

        self.session.status().notify(message);
    }

    fn select_mode(&self, state: &mut ControllerState, mode: LayerMode) {
        if state.mode != mode {
            state.mode = mode;
            self.on_mode_changed.emit(mode);
        }
    }

    fn select_channel(&self, state: &mut ControllerState, channel: Option<ChannelIdentifier>) {
        if state.selected != channel {
            state.selected = channel;
            self.session.select_exclusively(channel);
            self.on_selection_changed.emit(channel);
        }
    }

    /// Re-run the configuration that built the current layout.
    fn reapply(&self) {
        let mut state = self.state.lock();
        match state.reconfigure {
            Reconfigure::None => {}
            Reconfigure::Outputs(output) => self.configure_outputs(&mut state, output),
            Reconfigure::Sends(input) => self.configure_sends(&mut state, input),
            #[cfg(feature = "s-dca")]
            Reconfigure::SDca => self.configure_s_dca(&mut state),
        }
    }

    /// OUTPUTS layout for output `O`: strips 0..14 carry sources' sends into
    /// `O`, strip 15 is `O`'s master, feedback follows `O`.
    fn configure_outputs(&self, state: &mut ControllerState, output: ChannelIdentifier) {
        state.reconfigure = Reconfigure::Outputs(output);

        let mut universe: Vec<ChannelIdentifier> = self.session.input_channels().to_vec();
        // the last bank pages past the inputs into the FX returns
        if state.bank == 5 {
            universe.extend_from_slice(self.session.fx_return_channels());
        }

        let filtered = state.channel_filter;
        let visible = |ch: ChannelIdentifier| {
            self.session.get_label(ch).has_name()
                && (!filtered || self.session.get_send_level(ch, output) != Level::OFF)
        };

        let window: Vec<ChannelIdentifier> = if filtered {
            universe.into_iter().filter(|&ch| visible(ch)).collect()
        } else {
            let from = (state.bank as usize * 16).min(universe.len());
            let to = (from + 15).min(universe.len());
            universe[from..to]
                .iter()
                .copied()
                .filter(|&ch| visible(ch))
                .collect()
        };

        let mut index = 0;
        for ch in window {
            if index == 15 {
                break;
            }
            self.strips[index].bind_send(ch, output, true);
            index += 1;
        }

        for unused in index..15 {
            self.strips[unused].tie_to_zero();
        }

        if let Err(error) = self.session.change_feedback_source(Some(output)) {
            tracing::warn!(%error, "feedback routing failed");
        }
        self.strips[15].bind_master(output);
    }

    /// SENDS_ON_FADER layout for input `I`: strips 0..15 carry `I`'s sends
    /// into the destination family, feedback routing is cleared.
    fn configure_sends(&self, state: &mut ControllerState, input: ChannelIdentifier) {
        state.reconfigure = Reconfigure::Sends(input);

        let universe: Vec<ChannelIdentifier> = match state.sends_target {
            SendsTarget::Aux => self.session.aux_channels().to_vec(),
            SendsTarget::Fx => self
                .session
                .fx_channels()
                .iter()
                .chain(self.session.external_fx_channels().iter())
                .copied()
                .collect(),
        };

        let filtered = state.channel_filter;
        let visible = |ch: ChannelIdentifier| {
            self.session.get_label(ch).has_name()
                && (!filtered || self.session.get_send_level(input, ch) != Level::OFF)
        };

        let mut index = 0;
        for dest in universe.into_iter().filter(|&ch| visible(ch)) {
            if index == 16 {
                break;
            }
            self.strips[index].bind_send(input, dest, false);
            index += 1;
        }

        for unused in index..16 {
            self.strips[unused].tie_to_zero();
        }

        if let Err(error) = self.session.change_feedback_source(None) {
            tracing::warn!(%error, "clearing feedback routing failed");
        }
    }

    /// S-DCA layout: each visible output gets one strip driving the selected
    /// inputs' sends into it, relative to their current levels.
    #[cfg(feature = "s-dca")]
    fn configure_s_dca(&self, state: &mut ControllerState) {
        state.reconfigure = Reconfigure::SDca;

        let affected = self.session.selected_inputs();

        let mut index = 0;
        if !affected.is_empty() {
            for &output in self.session.send_channels() {
                if index == 16 {
                    break;
                }
                if !self.session.get_label(output).has_name() {
                    continue;
                }
                self.strips[index].bind_s_dca(&affected, output);
                index += 1;
            }
        }

        for unused in index..16 {
            self.strips[unused].tie_to_zero();
        }

        if let Err(error) = self.session.change_feedback_source(None) {
            tracing::warn!(%error, "clearing feedback routing failed");
        }
    }

    /// Toggle an input's membership in the S-DCA working set and rebuild.
    #[cfg(feature = "s-dca")]
    fn toggle_s_dca_channel(&self, input: ChannelIdentifier) {
        let selected = self.session.is_selected(input);
        if let Err(error) = self.session.set_selected(input, !selected) {
            tracing::warn!(%error, "selection update failed");
            return;
        }

        let mut state = self.state.lock();
        self.configure_s_dca(&mut state);
    }
}
