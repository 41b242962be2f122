//! End-to-end protocol scenarios: commands emitted by the session are fed
//! back through the framer and decoder, the way the console's echoes arrive.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use mixsurface::codec::{Decoder, DecoderShared, Encoder, Message, MidiStream};
use mixsurface::config::Config;
use mixsurface::entity::{Bank, ChannelIdentifier, Color, Label, Level, Scene};
use mixsurface::scheduler::Scheduler;
use mixsurface::session::Session;
use mixsurface::surface::StatusBoard;
use mixsurface::transport::CommandSink;
use mixsurface::Result;

const CONFIG: &str = r#"
    [dlive]
    ip = "127.0.0.1"
    midi_bank_offset = 1

    [control.tracking]
    number_of_inputs = 16
    number_of_mono_aux = 4
    mono_aux_start = 1
    number_of_stereo_aux = 1
    number_of_mono_fx = 2
    number_of_stereo_fx = 1
    external_fx_start = 7
    number_of_external_fx = 1
    number_of_fx_returns = 2
    virtual_start = 97
    feedback_matrix = 11
    talk_to_stage = 15
    talk_to_monitor = 16

    [control.scenes]
    mixing_start = 101
    virtual_left_start = 490
    virtual_right = 496
    sends = 201
    custom_aux = 301
    custom_fx = 302
    custom_util = 303
"#;

struct RecordingSink {
    writes: Mutex<Vec<Vec<u8>>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            writes: Mutex::new(Vec::new()),
        })
    }

    fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().clone()
    }
}

impl CommandSink for RecordingSink {
    fn send_bytes(&self, bytes: &[u8]) -> Result<bool> {
        self.writes.lock().push(bytes.to_vec());
        Ok(true)
    }
}

fn session() -> (Arc<Session>, Arc<RecordingSink>) {
    let sink = RecordingSink::new();
    let session = Session::new(
        &Config::from_toml(CONFIG).unwrap(),
        sink.clone() as Arc<dyn CommandSink>,
        Arc::new(Scheduler::new(1)),
        Arc::new(StatusBoard::new()),
    )
    .unwrap();

    (Arc::new(session), sink)
}

fn decoder() -> Decoder {
    Decoder::new(0, Arc::new(DecoderShared::new()))
}

fn decode_all(decoder: &Decoder, bytes: &[u8]) -> Vec<Message> {
    let mut stream = MidiStream::new();
    stream
        .feed(bytes)
        .into_iter()
        .filter_map(|raw| decoder.feed(raw))
        .collect()
}

fn input(index: u8) -> ChannelIdentifier {
    ChannelIdentifier::new(Bank::Input, index)
}

#[test]
fn scene_recall_round_trip() {
    let (session, sink) = session();

    session.change_scene_number(100).unwrap();
    let writes = sink.writes();
    assert_eq!(writes, vec![vec![0xB0, 0x00, 0x00, 0xC0, 0x64]]);

    let echoed = decode_all(&decoder(), &writes[0]);
    assert_eq!(echoed, vec![Message::Scene(Scene::checked(100).unwrap())]);
}

#[test]
fn set_mute_round_trip() {
    let (session, sink) = session();

    session.change_mute(input(0), true).unwrap();
    let writes = sink.writes();
    assert_eq!(writes, vec![vec![0x90, 0x00, 0x7F, 0x00, 0x00]]);

    let echoed = decode_all(&decoder(), &writes[0]);
    assert_eq!(echoed, vec![Message::Mute(input(0), true)]);

    // the echo resolves the queued request
    session.apply_message(echoed[0].clone());
    assert!(session.get_mute(input(0)));
}

#[test]
fn short_form_send_level_matches_long_form() {
    let header = [0x00, 0x00, 0x1A, 0x50, 0x10, 0x01, 0x00];

    let mut short = vec![0xF0];
    short.extend_from_slice(&header);
    short.extend_from_slice(&[0x00, 0x0D, 0x00, 0x00, 0x00, 0x6B]);
    // firmware drops the destination bank byte in the 5-byte short form
    let mut long = short.clone();
    short.remove(11);
    short.push(0xF7);
    long.push(0xF7);

    let expected = vec![Message::SendLevel {
        from: input(0),
        to: input(0),
        level: Level::ZERO_DB,
    }];

    assert_eq!(decode_all(&decoder(), &short), expected);
    assert_eq!(decode_all(&decoder(), &long), expected);
}

#[test]
fn ambiguous_colour_vs_mute_echo() {
    let frame = [
        0xF0, 0x00, 0x00, 0x1A, 0x50, 0x10, 0x01, 0x00, 0x00, 0x05, 0x09, 0x03, 0xF7,
    ];

    // quirks mode off: a colour report for input 10
    let plain = decoder();
    assert_eq!(
        decode_all(&plain, &frame),
        vec![Message::Color(input(9), Color::Yellow)]
    );

    // quirks mode on: the same bytes are ambiguous
    let shared = Arc::new(DecoderShared::new());
    shared.set_quirks_mode(true);
    let quirky = Decoder::new(0, shared);
    match &decode_all(&quirky, &frame)[..] {
        [Message::UnknownSysex { reason, .. }] => {
            assert!(reason.contains("ambiguous"), "reason: {reason}");
        }
        other => panic!("expected UnknownSysex, got {other:?}"),
    }
}

#[test]
fn scheduler_cancel_wins() {
    let scheduler = Scheduler::new(1);
    let ran = Arc::new(Mutex::new(false));

    {
        let ran = Arc::clone(&ran);
        scheduler.execute_delayed("k7", Duration::from_secs(1), move || {
            *ran.lock() = true;
        });
    }
    std::thread::sleep(Duration::from_millis(10));
    assert!(scheduler.cancel("k7"));

    std::thread::sleep(Duration::from_millis(200));
    assert!(!*ran.lock());

    {
        let ran = Arc::clone(&ran);
        scheduler.execute_delayed("k7", Duration::from_secs(1), move || {
            *ran.lock() = true;
        });
    }
    std::thread::sleep(Duration::from_millis(1200));
    assert!(!scheduler.cancel("k7"));
    assert!(*ran.lock());
}

#[test]
fn every_command_round_trips() {
    let encoder = Encoder::new(0);
    let aux = ChannelIdentifier::new(Bank::MonoAux, 2);
    let source = input(4);

    let cases: Vec<(Vec<u8>, Message)> = vec![
        (
            encoder.recall_scene(Scene::checked(321).unwrap()),
            Message::Scene(Scene::checked(321).unwrap()),
        ),
        (
            encoder.label(source, &Label::new("Vocals")),
            Message::Label(source, Label::new("Vocals")),
        ),
        (
            encoder.color(aux, Color::Purple),
            Message::Color(aux, Color::Purple),
        ),
        (encoder.mute(aux, false), Message::Mute(aux, false)),
        (
            encoder.level(source, Level::FADER_MIDPOINT),
            Message::Level(source, Level::FADER_MIDPOINT),
        ),
        (
            encoder.send_level(source, aux, Level::ZERO_DB),
            Message::SendLevel {
                from: source,
                to: aux,
                level: Level::ZERO_DB,
            },
        ),
    ];

    for (bytes, expected) in cases {
        let decoded = decode_all(&decoder(), &bytes);
        assert_eq!(decoded, vec![expected], "bytes: {bytes:02X?}");
    }
}

#[test]
fn round_trip_survives_a_nonzero_bank_offset() {
    let encoder = Encoder::new(3);
    let decoder = Decoder::new(3, Arc::new(DecoderShared::new()));
    let source = input(7);
    let aux = ChannelIdentifier::new(Bank::StereoAux, 1);

    let bytes = encoder.send_level(source, aux, Level::FULL);
    let decoded = decode_all(&decoder, &bytes);

    assert_eq!(
        decoded,
        vec![Message::SendLevel {
            from: source,
            to: aux,
            level: Level::FULL,
        }]
    );
}

#[test]
fn command_stream_decodes_in_order() {
    let (session, sink) = session();

    session.change_mute(input(1), true).unwrap();
    session.change_level(input(1), Level::ZERO_DB).unwrap();
    session.change_scene_number(42).unwrap();

    let mut wire = Vec::new();
    for write in sink.writes() {
        wire.extend_from_slice(&write);
    }

    let decoded = decode_all(&decoder(), &wire);
    assert_eq!(
        decoded,
        vec![
            Message::Mute(input(1), true),
            Message::Level(input(1), Level::ZERO_DB),
            Message::Scene(Scene::checked(42).unwrap()),
        ]
    );
}
