//! Virtual fader strip binder
//!
//! Each of the 16 physical strips is backed by a real channel in the INPUT
//! bank that the console treats as a fader. A strip never owns audio state;
//! it translates level and mute changes on its own channel into `change_*`
//! calls on a bound target, and its label/color mirror the target with a
//! binding prefix (`>` send, `@` inverse send, `M ` master, `=` S-DCA,
//! `[V-Ch]` unbound).
//!
//! Rebinding happens constantly while the operator pages through layers;
//! the binding is swapped under a per-strip lock so a level arriving during
//! a transition is handled entirely under the old or the new mapping.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::entity::{ChannelIdentifier, Color, Label, Level};
use crate::session::Session;

/// What a strip is currently bound to.
#[derive(Debug, Clone)]
enum Binding {
    Unbound,
    TieToZero,
    TrackSend {
        base: ChannelIdentifier,
        dest: ChannelIdentifier,
    },
    TrackMaster {
        base: ChannelIdentifier,
    },
    #[cfg(feature = "s-dca")]
    SDca {
        dest: ChannelIdentifier,
        affected: Vec<(ChannelIdentifier, Level)>,
    },
}

/// Strip mode, for UI display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StripMode {
    /// Not bound; the fader mutes itself
    Unbound,
    /// The fader sticks to the bottom position
    TieToZero,
    /// The fader drives a send level
    TrackSendLevel,
    /// The fader drives an output master
    TrackMasterLevel,
    /// The fader drives a relative group of send levels
    #[cfg(feature = "s-dca")]
    SDca,
}

/// One rebindable fader strip.
pub struct VirtualStrip {
    channel: ChannelIdentifier,
    session: Weak<Session>,
    binding: Mutex<Binding>,
}

impl VirtualStrip {
    /// Create a strip for a virtual channel and subscribe it to the
    /// session's level and mute updates.
    pub fn new(session: &Arc<Session>, channel: ChannelIdentifier) -> Arc<Self> {
        let strip = Arc::new(Self {
            channel,
            session: Arc::downgrade(session),
            binding: Mutex::new(Binding::Unbound),
        });

        let weak = Arc::downgrade(&strip);
        session.on_update_level().subscribe(move |(ch, level)| {
            if let Some(strip) = weak.upgrade() {
                if *ch == strip.channel {
                    strip.on_level_changed(*level);
                }
            }
        });

        let weak = Arc::downgrade(&strip);
        session.on_update_mute().subscribe(move |(ch, muted)| {
            if let Some(strip) = weak.upgrade() {
                if *ch == strip.channel {
                    strip.on_mute_changed(*muted);
                }
            }
        });

        strip
    }

    /// The backing virtual channel
    pub fn channel(&self) -> ChannelIdentifier {
        self.channel
    }

    /// Current mode
    pub fn mode(&self) -> StripMode {
        match &*self.binding.lock() {
            Binding::Unbound => StripMode::Unbound,
            Binding::TieToZero => StripMode::TieToZero,
            Binding::TrackSend { .. } => StripMode::TrackSendLevel,
            Binding::TrackMaster { .. } => StripMode::TrackMasterLevel,
            #[cfg(feature = "s-dca")]
            Binding::SDca { .. } => StripMode::SDca,
        }
    }

    /// Track the send level `base -> dest`.
    ///
    /// With `label_from_base` the strip mirrors the base channel (`@`),
    /// otherwise the destination (`>`). Rejected when the send level has not
    /// been resolved yet.
    pub fn bind_send(
        &self,
        base: ChannelIdentifier,
        dest: ChannelIdentifier,
        label_from_base: bool,
    ) -> bool {
        let Some(session) = self.session.upgrade() else {
            return false;
        };

        let Some(level) = session.get_send_level_opt(base, dest) else {
            tracing::warn!(
                base = %base.short_label(),
                dest = %dest.short_label(),
                "send level not settled yet"
            );
            session.status().set_status("Not synced | Try again");
            return false;
        };

        *self.binding.lock() = Binding::TrackSend { base, dest };

        let (mirror, prefix) = if label_from_base {
            (base, "@")
        } else {
            (dest, ">")
        };

        self.push(&session, session.get_label(mirror).with_prefix(prefix), session.get_color(mirror), false, level);
        true
    }

    /// Mirror an output master: level and mute both ways.
    pub fn bind_master(&self, base: ChannelIdentifier) {
        let Some(session) = self.session.upgrade() else {
            return;
        };

        *self.binding.lock() = Binding::TrackMaster { base };

        self.push(
            &session,
            session.get_label(base).with_prefix("M "),
            session.get_color(base),
            session.get_mute(base),
            session.get_level(base),
        );
    }

    /// Drive the sends of several base channels to `dest` relative to their
    /// current levels, from a single fader starting at the midpoint.
    ///
    /// Rejected when any involved send level is still unresolved.
    #[cfg(feature = "s-dca")]
    pub fn bind_s_dca(&self, bases: &[ChannelIdentifier], dest: ChannelIdentifier) -> bool {
        let Some(session) = self.session.upgrade() else {
            return false;
        };

        let mut affected = Vec::with_capacity(bases.len());
        for &base in bases {
            match session.get_send_level_opt(base, dest) {
                Some(level) => affected.push((base, level)),
                None => {
                    tracing::warn!(
                        dest = %dest.short_label(),
                        "send levels not settled yet"
                    );
                    session.status().set_status("Not synced | Try again");
                    return false;
                }
            }
        }

        for &base in bases {
            if !session.is_s_dca_affected(base) {
                session.backup_sends(base);
            }
        }

        *self.binding.lock() = Binding::SDca { dest, affected };

        self.push(
            &session,
            session.get_label(dest).with_prefix("="),
            session.get_color(dest),
            false,
            Level::FADER_MIDPOINT,
        );
        true
    }

    /// Stick the fader to the bottom position.
    pub fn tie_to_zero(&self) {
        let Some(session) = self.session.upgrade() else {
            return;
        };

        *self.binding.lock() = Binding::TieToZero;
        self.push(&session, Label::default(), Color::Off, false, Level::OFF);
    }

    /// Release the binding; the strip mutes itself.
    pub fn unbind(&self) {
        let Some(session) = self.session.upgrade() else {
            return;
        };

        *self.binding.lock() = Binding::Unbound;
        self.push(&session, Label::unbound(), Color::Off, true, Level::OFF);
    }

    fn push(&self, session: &Session, label: Label, color: Color, mute: bool, level: Level) {
        self.checked(session.change_label(self.channel, label));
        self.checked(session.change_color(self.channel, color));
        self.checked(session.change_mute(self.channel, mute));
        self.checked(session.change_level(self.channel, level));
    }

    fn checked(&self, result: crate::Result<()>) {
        if let Err(error) = result {
            tracing::warn!(%error, strip = %self.channel.short_label(), "strip update failed");
        }
    }

    fn on_level_changed(&self, level: Level) {
        let Some(session) = self.session.upgrade() else {
            return;
        };

        let binding = self.binding.lock().clone();

        match binding {
            Binding::Unbound => {}
            Binding::TieToZero => {
                if level > Level::OFF {
                    self.checked(session.change_level(self.channel, Level::OFF));
                }
            }
            Binding::TrackSend { base, dest } => {
                self.checked(session.change_send_level(base, dest, level));
            }
            Binding::TrackMaster { base } => {
                self.checked(session.change_level(base, level));
            }
            #[cfg(feature = "s-dca")]
            Binding::SDca { dest, affected } => {
                self.apply_s_dca(&session, level, dest, &affected);
            }
        }
    }

    fn on_mute_changed(&self, muted: bool) {
        let Some(session) = self.session.upgrade() else {
            return;
        };

        let binding = self.binding.lock().clone();

        match binding {
            // these faders must stay unmuted
            Binding::TieToZero | Binding::TrackSend { .. } => {
                if muted {
                    self.checked(session.change_mute(self.channel, false));
                }
            }
            #[cfg(feature = "s-dca")]
            Binding::SDca { .. } => {
                if muted {
                    self.checked(session.change_mute(self.channel, false));
                }
            }
            Binding::Unbound => {
                if !muted {
                    self.checked(session.change_mute(self.channel, true));
                }
            }
            Binding::TrackMaster { base } => {
                self.checked(session.change_mute(base, muted));
            }
        }
    }

    /// Map the fader position across the affected set as a relative change:
    /// at the midpoint nothing moves; above it every send walks towards
    /// `FULL`, below towards `OFF`, proportionally to its own distance.
    #[cfg(feature = "s-dca")]
    fn apply_s_dca(
        &self,
        session: &Session,
        level: Level,
        dest: ChannelIdentifier,
        affected: &[(ChannelIdentifier, Level)],
    ) {
        if level == Level::FADER_MIDPOINT {
            return;
        }

        let midpoint = Level::FADER_MIDPOINT.value() as f32;
        let position = level.value() as f32;

        let reference = if level > Level::FADER_MIDPOINT {
            Level::FULL.value() as f32
        } else {
            Level::OFF.value() as f32
        };

        for &(base, base_level) in affected {
            let origin = base_level.value() as f32;
            let delta = (reference - origin) * (position - midpoint) / (reference - midpoint);
            let target = Level::from_i32(base_level.value() as i32 + delta.round() as i32);

            self.checked(session.change_send_level(base, dest, target));
            session.mark_s_dca_affected(base, dest);
        }
    }
}
