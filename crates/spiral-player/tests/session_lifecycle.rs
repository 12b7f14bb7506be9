//! Controller behaviour against a fake decoder and sink.
//!
//! The fake supervisor hands out in-memory pipes, so these tests drive the
//! diagnostic stream by hand and never spawn a process or open a device.

mod common;

use std::time::Duration;

use common::fakes::{FakeSink, FakeSupervisor};
use spiral_player::controller::{self, PlayerCore};
use spiral_player::diagnostics::{SessionEvent, SessionEventKind};
use spiral_player::error::PlayerError;
use spiral_player::sink::{AudioSink, PcmFormat, SampleFormat, PCM_FORMAT};
use spiral_player::supervisor::InvocationMode;
use spiral_proto::config::DecoderKind;
use spiral_proto::protocol::{MetadataEvent, PlayerEvent};
use spiral_proto::state::PlayState;
use tokio::sync::broadcast;

const STREAM: &str = "https://example.com/stream.mp3";

type Core = PlayerCore<FakeSupervisor, FakeSink>;

fn core_with_volume(volume: f32) -> (Core, FakeSupervisor, broadcast::Receiver<PlayerEvent>) {
    let supervisor = FakeSupervisor::new(DecoderKind::Ffmpeg);
    let (events, rx) = broadcast::channel(64);
    let core = PlayerCore::new(supervisor.clone(), FakeSink::new(volume), events);
    (core, supervisor, rx)
}

fn core() -> (Core, FakeSupervisor, broadcast::Receiver<PlayerEvent>) {
    core_with_volume(1.0)
}

/// Deliver the next session event to the controller.
async fn pump(core: &mut Core) -> SessionEvent {
    let event = tokio::time::timeout(Duration::from_secs(2), core.next_session_event())
        .await
        .expect("timed out waiting for a session event")
        .expect("session channel closed");
    core.handle_session_event(event.clone());
    event
}

fn drain(rx: &mut broadcast::Receiver<PlayerEvent>) -> Vec<PlayerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Load `STREAM` and let the decoder announce its output.
async fn start_playing(core: &mut Core, supervisor: &FakeSupervisor) -> common::fakes::FakeDecoder {
    core.load(STREAM).unwrap();
    let mut decoder = supervisor.take_decoder();
    decoder.say("Output #0, s16le, to 'pipe:':\n").await;
    let event = pump(core).await;
    assert_eq!(
        event.kind,
        SessionEventKind::Metadata(MetadataEvent::PlaybackStarted)
    );
    assert_eq!(core.state(), PlayState::Playing);
    decoder
}

#[tokio::test]
async fn test_load_play_pause_stop() {
    let (mut core, supervisor, mut rx) = core();

    core.load(STREAM).unwrap();
    assert_eq!(core.state(), PlayState::Loading);
    assert_eq!(
        supervisor.starts(),
        vec![(STREAM.to_string(), InvocationMode::Stream)]
    );
    assert!(core.sink().is_open());
    assert!(core.sink().holds_audio());

    let mut decoder = supervisor.take_decoder();
    decoder.say("Out").await;
    decoder.say("put #0, wav\n").await;
    pump(&mut core).await;
    assert_eq!(core.state(), PlayState::Playing);
    assert!(core.sink().is_playing());

    // A second start marker is dropped; the title is the next thing through.
    decoder.say("Output #0, wav\n").await;
    decoder.say("    StreamTitle: Artist - Song Name  \n").await;
    let event = pump(&mut core).await;
    assert_eq!(
        event.kind,
        SessionEventKind::Metadata(MetadataEvent::TitleChanged("Artist - Song Name".into()))
    );

    let events = drain(&mut rx);
    assert_eq!(
        events,
        vec![
            PlayerEvent::StateChanged {
                state: PlayState::Loading
            },
            PlayerEvent::VolumeChanged { volume: 1.0 },
            PlayerEvent::PlaybackStarted,
            PlayerEvent::StateChanged {
                state: PlayState::Playing
            },
            PlayerEvent::TitleChanged {
                title: "Artist - Song Name".into()
            },
        ]
    );
    assert_eq!(core.snapshot().title.as_deref(), Some("Artist - Song Name"));

    core.pause().unwrap();
    assert_eq!(core.state(), PlayState::Paused);
    assert!(!core.sink().is_playing());
    core.pause().unwrap();
    assert_eq!(core.state(), PlayState::Paused);
    assert_eq!(
        drain(&mut rx),
        vec![PlayerEvent::StateChanged {
            state: PlayState::Paused
        }]
    );

    core.stop().unwrap();
    assert_eq!(core.state(), PlayState::Stopped);
    assert!(!core.sink().is_playing());
    assert!(!core.sink().is_open());
    assert!(!core.sink().holds_audio());
    assert_eq!(supervisor.terminations(), 1);
    assert_eq!(core.session_id(), None);
    assert!(decoder.diagnostics_released().await);
    assert!(decoder.control_released().await);
    assert_eq!(core.snapshot().url, None);
}

#[tokio::test]
async fn test_load_while_active_is_noop() {
    let (mut core, supervisor, _rx) = core();
    core.load(STREAM).unwrap();
    let session = core.session_id();

    core.load("https://example.com/other.mp3").unwrap();
    assert_eq!(core.session_id(), session);
    assert_eq!(core.state(), PlayState::Loading);
    assert_eq!(supervisor.starts().len(), 1);
    assert_eq!(core.sink().opens, 1);
}

#[tokio::test]
async fn test_stop_from_stopped_and_close_twice() {
    let (mut core, supervisor, mut rx) = core();
    core.stop().unwrap();
    core.close();
    core.close();
    assert_eq!(core.state(), PlayState::Stopped);
    assert!(drain(&mut rx).is_empty());

    let _decoder = start_playing(&mut core, &supervisor).await;
    core.close();
    core.close();
    assert_eq!(core.state(), PlayState::Stopped);
    assert_eq!(supervisor.terminations(), 1);
}

#[tokio::test]
async fn test_stop_is_ignored_while_loading() {
    let (mut core, supervisor, _rx) = core();
    core.load(STREAM).unwrap();
    core.stop().unwrap();
    assert_eq!(core.state(), PlayState::Loading);
    assert_eq!(supervisor.terminations(), 0);

    core.close();
    assert_eq!(core.state(), PlayState::Stopped);
    assert_eq!(supervisor.terminations(), 1);
}

#[tokio::test]
async fn test_operations_without_session_are_benign() {
    let (mut core, _supervisor, mut rx) = core();
    for result in [
        core.play(),
        core.pause(),
        core.mute(),
        core.inc_volume(),
        core.dec_volume(),
    ] {
        let err = result.unwrap_err();
        assert!(matches!(err, PlayerError::NotLoaded));
        assert!(err.is_benign());
    }
    assert_eq!(core.state(), PlayState::Stopped);
    assert!(!core.snapshot().is_playing);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_volume_stays_in_range() {
    let (mut core, supervisor, _rx) = core_with_volume(0.5);
    let _decoder = start_playing(&mut core, &supervisor).await;

    for _ in 0..3 {
        core.inc_volume().unwrap();
    }
    assert_eq!(core.sink().volume(), 0.65);
    for _ in 0..3 {
        core.dec_volume().unwrap();
    }
    assert_eq!(core.sink().volume(), 0.5);

    for _ in 0..30 {
        core.inc_volume().unwrap();
    }
    assert_eq!(core.sink().volume(), 1.0);
    for _ in 0..30 {
        core.dec_volume().unwrap();
    }
    assert_eq!(core.sink().volume(), 0.0);
}

#[tokio::test]
async fn test_volume_restores_from_off_grid_start() {
    let (mut core, supervisor, _rx) = core_with_volume(0.333);
    let _decoder = start_playing(&mut core, &supervisor).await;
    let start = core.sink().volume();
    assert_eq!(start, 0.33);

    core.inc_volume().unwrap();
    assert_eq!(core.sink().volume(), 0.38);
    core.dec_volume().unwrap();
    assert_eq!(core.sink().volume(), start);

    for _ in 0..9 {
        core.inc_volume().unwrap();
    }
    for _ in 0..9 {
        core.dec_volume().unwrap();
    }
    assert_eq!(core.sink().volume(), start);

    // The level restored on unmute is on the same grid.
    core.mute().unwrap();
    core.mute().unwrap();
    core.inc_volume().unwrap();
    core.dec_volume().unwrap();
    assert_eq!(core.sink().volume(), start);
}

#[tokio::test]
async fn test_volume_only_changes_while_playing() {
    let (mut core, supervisor, _rx) = core_with_volume(0.5);
    core.load(STREAM).unwrap();
    core.inc_volume().unwrap();
    assert_eq!(core.sink().volume(), 0.5);

    let mut decoder = supervisor.take_decoder();
    decoder.say("Output #0, wav\n").await;
    pump(&mut core).await;
    core.pause().unwrap();
    core.dec_volume().unwrap();
    assert_eq!(core.sink().volume(), 0.5);
}

#[tokio::test]
async fn test_mute_twice_restores_volume() {
    let (mut core, supervisor, mut rx) = core_with_volume(0.7);
    let _decoder = start_playing(&mut core, &supervisor).await;
    drain(&mut rx);

    core.mute().unwrap();
    assert!(core.sink().is_muted());
    assert!(core.snapshot().muted);
    core.mute().unwrap();
    assert_eq!(core.sink().volume(), 0.7);
    assert_eq!(
        drain(&mut rx),
        vec![
            PlayerEvent::VolumeChanged { volume: 0.0 },
            PlayerEvent::VolumeChanged { volume: 0.7 },
        ]
    );
}

#[tokio::test]
async fn test_decoder_exit_returns_to_stopped() {
    let (mut core, supervisor, mut rx) = core();
    let decoder = start_playing(&mut core, &supervisor).await;
    drain(&mut rx);

    drop(decoder);
    let event = pump(&mut core).await;
    assert_eq!(event.kind, SessionEventKind::Exited);
    assert_eq!(core.state(), PlayState::Stopped);
    assert!(!core.sink().is_open());
    assert_eq!(supervisor.terminations(), 1);
    assert_eq!(
        drain(&mut rx),
        vec![PlayerEvent::StateChanged {
            state: PlayState::Stopped
        }]
    );
    // The URL is kept so play can bring the stream back.
    assert_eq!(core.snapshot().url.as_deref(), Some(STREAM));
}

#[tokio::test]
async fn test_decoder_exit_before_start_is_reported() {
    let (mut core, supervisor, mut rx) = core();
    core.load(STREAM).unwrap();
    drop(supervisor.take_decoder());

    pump(&mut core).await;
    assert_eq!(core.state(), PlayState::Stopped);
    let events = drain(&mut rx);
    assert!(
        events
            .iter()
            .any(|e| matches!(e, PlayerEvent::Error { message } if message.contains(STREAM))),
        "{:?}",
        events
    );
    assert!(!events.contains(&PlayerEvent::PlaybackStarted));
}

#[tokio::test]
async fn test_play_after_exit_reloads() {
    let (mut core, supervisor, _rx) = core();
    let decoder = start_playing(&mut core, &supervisor).await;
    drop(decoder);
    pump(&mut core).await;

    core.play().unwrap();
    assert_eq!(core.state(), PlayState::Loading);
    assert_eq!(supervisor.starts().len(), 2);
    assert!(core.sink().is_playing());
}

#[tokio::test]
async fn test_play_reloads_crashed_decoder() {
    let (mut core, supervisor, _rx) = core();
    let _decoder = start_playing(&mut core, &supervisor).await;
    let first = core.session_id();

    supervisor.crash();
    core.play().unwrap();
    assert_ne!(core.session_id(), first);
    assert_eq!(core.state(), PlayState::Loading);
    assert_eq!(supervisor.starts().len(), 2);
}

#[tokio::test]
async fn test_play_resumes_paused_session() {
    let (mut core, supervisor, _rx) = core();
    let _decoder = start_playing(&mut core, &supervisor).await;
    core.pause().unwrap();

    core.play().unwrap();
    assert_eq!(core.state(), PlayState::Playing);
    assert!(core.sink().is_playing());
    assert_eq!(supervisor.starts().len(), 1);
}

#[tokio::test]
async fn test_stale_session_events_are_ignored() {
    let (mut core, supervisor, mut rx) = core();
    let _decoder = start_playing(&mut core, &supervisor).await;
    drain(&mut rx);

    let stale = core.session_id().unwrap() + 41;
    core.handle_session_event(SessionEvent {
        session: stale,
        kind: SessionEventKind::Exited,
    });
    core.handle_session_event(SessionEvent {
        session: stale,
        kind: SessionEventKind::Metadata(MetadataEvent::TitleChanged("old".into())),
    });
    assert_eq!(core.state(), PlayState::Playing);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_new_session_does_not_hear_old_decoder() {
    let (mut core, supervisor, _rx) = core();
    let mut old = start_playing(&mut core, &supervisor).await;
    core.stop().unwrap();
    assert!(old.diagnostics_released().await);

    core.load(STREAM).unwrap();
    let mut new = supervisor.take_decoder();
    new.say("StreamTitle: Early\nOutput #0\n").await;
    let first = pump(&mut core).await;
    let second = pump(&mut core).await;
    assert_eq!(first.session, core.session_id().unwrap());
    assert_eq!(
        first.kind,
        SessionEventKind::Metadata(MetadataEvent::PlaybackStarted)
    );
    assert_eq!(
        second.kind,
        SessionEventKind::Metadata(MetadataEvent::TitleChanged("Early".into()))
    );
}

#[tokio::test]
async fn test_playlist_urls_select_playlist_mode() {
    let (mut core, supervisor, _rx) = core();
    core.load("http://radio.example/listen.PLS?sid=1").unwrap();
    core.close();
    core.load("http://radio.example/stream.m3u").unwrap();
    core.close();
    core.load("http://radio.example/stream.m3u8").unwrap();

    let modes: Vec<_> = supervisor.starts().into_iter().map(|(_, m)| m).collect();
    assert_eq!(
        modes,
        vec![
            InvocationMode::Playlist,
            InvocationMode::Playlist,
            InvocationMode::Stream
        ]
    );
}

#[tokio::test]
async fn test_spawn_failure_leaves_player_stopped() {
    let (mut core, supervisor, mut rx) = core();
    supervisor.fail_next_start();

    let err = core.load(STREAM).unwrap_err();
    assert!(err.is_spawn_error());
    assert_eq!(core.state(), PlayState::Stopped);
    assert!(!core.sink().is_open());
    assert!(drain(&mut rx).is_empty());

    core.load(STREAM).unwrap();
    assert_eq!(core.state(), PlayState::Loading);
}

#[tokio::test]
async fn test_sink_failure_terminates_decoder() {
    let supervisor = FakeSupervisor::new(DecoderKind::Ffmpeg);
    let (events, _rx) = broadcast::channel(8);
    let mut sink = FakeSink::new(1.0);
    sink.fail_open = true;
    let mut core = PlayerCore::new(supervisor.clone(), sink, events);

    let err = core.load(STREAM).unwrap_err();
    assert!(matches!(err, PlayerError::DeviceInit(_)));
    assert_eq!(core.state(), PlayState::Stopped);
    assert_eq!(supervisor.terminations(), 1);
}

#[tokio::test]
async fn test_decoder_asked_for_sink_format() {
    let supervisor = FakeSupervisor::new(DecoderKind::Ffmpeg);
    let (events, _rx) = broadcast::channel(8);
    let mut sink = FakeSink::new(1.0);
    // A device that only runs at 48kHz.
    let device = PcmFormat {
        sample_rate: 48000,
        channels: 2,
        sample_format: SampleFormat::S16Le,
    };
    sink.format = device;
    let mut core = PlayerCore::new(supervisor.clone(), sink, events);

    core.load(STREAM).unwrap();
    assert_eq!(supervisor.formats(), vec![device]);
    assert_eq!(core.state(), PlayState::Loading);
}

#[tokio::test]
async fn test_default_sink_format_for_decoder() {
    let (mut core, supervisor, _rx) = core();
    core.load(STREAM).unwrap();
    assert_eq!(supervisor.formats(), vec![PCM_FORMAT]);
}

#[tokio::test]
async fn test_handle_drives_actor() {
    let supervisor = FakeSupervisor::new(DecoderKind::Ffmpeg);
    let (events, _) = broadcast::channel(64);
    let core = PlayerCore::new(supervisor.clone(), FakeSink::new(0.8), events);
    let (handle, task) = controller::spawn(core);
    let mut rx = handle.subscribe();

    handle.load(STREAM).await.unwrap();
    handle.play().await.unwrap();
    let mut decoder = supervisor.take_decoder();
    decoder.say("Output #0, wav\nStreamTitle: Live Show\n").await;

    let mut seen = Vec::new();
    while !seen.contains(&PlayerEvent::TitleChanged {
        title: "Live Show".into(),
    }) {
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for events")
            .unwrap();
        seen.push(event);
    }
    let started = seen
        .iter()
        .filter(|e| **e == PlayerEvent::PlaybackStarted)
        .count();
    assert_eq!(started, 1);

    let snapshot = handle.status().await.unwrap();
    assert_eq!(snapshot.state, PlayState::Playing);
    assert!(snapshot.is_playing);
    assert_eq!(snapshot.title.as_deref(), Some("Live Show"));

    handle.shutdown().await.unwrap();
    task.await.unwrap();
    assert!(matches!(handle.play().await, Err(PlayerError::Closed)));
    assert!(decoder.diagnostics_released().await);
}
