//! Session lifecycle with an in-memory link

use busmon_core::config::{Configuration, MediumSettings, SerialTarget};
use busmon_core::core::frame::MC_BUSMON_IND;
use busmon_core::{
    parse_args, CloseInitiator, FrameSink, LinkCore, LinkError, LinkFactory, LinkListener,
    MonitorLink, MonitorSession, MonitorState, Options, SessionError, SessionOutcome,
    TerminationTrigger,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

struct MemoryLink {
    core: LinkCore,
    alive: Arc<AtomicBool>,
    closes: Arc<AtomicUsize>,
    decode: Arc<AtomicBool>,
}

impl MonitorLink for MemoryLink {
    fn add_listener(&mut self, listener: Arc<dyn LinkListener>) {
        self.core.add_listener(listener);
    }

    fn set_decode_raw_frames(&mut self, decode: bool) {
        self.decode.store(decode, Ordering::SeqCst);
        self.core.set_decode_raw_frames(decode);
    }

    fn is_open(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && self.core.is_open()
    }

    fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.core.close(CloseInitiator::Client, "user request");
    }

    fn medium(&self) -> &MediumSettings {
        self.core.medium()
    }

    fn name(&self) -> &str {
        self.core.name()
    }
}

#[derive(Default)]
struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl FrameSink for MemorySink {
    fn write_line(&self, line: &str) {
        self.lines.lock().push(line.to_string());
    }
}

#[derive(Default)]
struct Probe {
    core: Mutex<Option<LinkCore>>,
    alive: Arc<AtomicBool>,
    closes: Arc<AtomicUsize>,
    decode: Arc<AtomicBool>,
    opened: AtomicUsize,
    // Delivered by the link while it is still being constructed
    early_frame: Mutex<Option<Vec<u8>>>,
}

impl Probe {
    fn core(&self) -> LinkCore {
        self.core.lock().clone().expect("link not opened")
    }

    fn deliver(&self, cemi: &[u8]) {
        self.core().deliver_frame(cemi);
    }
}

struct MemoryFactory(Arc<Probe>);

impl LinkFactory for MemoryFactory {
    fn open(&self, config: &Configuration) -> Result<Box<dyn MonitorLink>, LinkError> {
        let probe = &self.0;
        probe.opened.fetch_add(1, Ordering::SeqCst);
        probe.alive.store(true, Ordering::SeqCst);
        let core = LinkCore::start("memory", config.medium_settings())?;
        *probe.core.lock() = Some(core.clone());
        if let Some(cemi) = probe.early_frame.lock().take() {
            core.deliver_frame(&cemi);
        }
        Ok(Box::new(MemoryLink {
            core,
            alive: probe.alive.clone(),
            closes: probe.closes.clone(),
            decode: probe.decode.clone(),
        }))
    }
}

fn session(compact: bool) -> (MonitorSession, Arc<Probe>, Arc<MemorySink>) {
    let probe = Arc::new(Probe::default());
    let sink = Arc::new(MemorySink::default());
    let config = Configuration::serial(SerialTarget::Index(1)).compact(compact);
    let session = MonitorSession::with_factory(
        config,
        Arc::new(MemoryFactory(probe.clone())),
        sink.clone(),
    );
    (session, probe, sink)
}

fn busmon(status: u8, raw: &[u8]) -> Vec<u8> {
    let mut cemi = vec![MC_BUSMON_IND, 0x03, 0x03, 0x01, status];
    cemi.extend_from_slice(raw);
    cemi
}

fn group_write() -> Vec<u8> {
    let mut raw = vec![0xBC, 0x11, 0x05, 0x08, 0x01, 0xE1, 0x00, 0x81];
    raw.push(!raw.iter().fold(0u8, |acc, b| acc ^ b));
    raw
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

fn strip_timestamp(line: &str) -> &str {
    let (time, rest) = line.split_once(' ').unwrap();
    assert_eq!(time.len(), "00:00:00.000".len(), "bad timestamp in {line}");
    assert_eq!(time.as_bytes()[2], b':');
    assert_eq!(time.as_bytes()[8], b'.');
    rest
}

#[test]
fn start_enables_decoding_and_opens() {
    let (session, probe, _) = session(true);
    assert_eq!(session.state(), MonitorState::Idle);
    session.start().unwrap();
    assert_eq!(session.state(), MonitorState::Open);
    assert!(probe.decode.load(Ordering::SeqCst));
    assert_eq!(probe.opened.load(Ordering::SeqCst), 1);
}

#[test]
fn frames_are_formatted_in_order() {
    let (session, probe, sink) = session(true);
    session.start().unwrap();

    for seq in 0..5u8 {
        probe.deliver(&busmon(seq, &[0xCC]));
    }
    assert!(wait_until(|| session.stats().frames_formatted == 5));

    let lines = sink.lines.lock().clone();
    for (seq, line) in lines.iter().enumerate() {
        assert_eq!(strip_timestamp(line), format!("Seq {seq} ACK"));
    }
    assert_eq!(lines.len(), 5);
}

#[test]
fn compact_and_verbose_rendering() {
    let (compact, probe, sink) = session(true);
    compact.start().unwrap();
    probe.deliver(&busmon(0x04, &group_write()));
    assert!(wait_until(|| !sink.lines.lock().is_empty()));
    assert_eq!(
        strip_timestamp(&sink.lines.lock()[0]),
        "Seq 4 L_Data low from 1.1.5 to 1/0/1, hop count 6, tpdu 00 81: GroupValue_Write 01"
    );

    let (verbose, probe, sink) = session(false);
    verbose.start().unwrap();
    probe.deliver(&busmon(0x04, &group_write()));
    assert!(wait_until(|| !sink.lines.lock().is_empty()));
    assert_eq!(
        strip_timestamp(&sink.lines.lock()[0]),
        "BusMon.ind seq 4: bc 11 05 08 01 e1 00 81 3e = \
         L_Data low from 1.1.5 to 1/0/1, hop count 6, tpdu 00 81: GroupValue_Write 01"
    );
}

#[test]
fn frame_received_during_link_construction_is_shown() {
    let (session, probe, sink) = session(true);
    *probe.early_frame.lock() = Some(busmon(0x04, &group_write()));
    session.start().unwrap();

    assert!(wait_until(|| !sink.lines.lock().is_empty()));
    assert_eq!(
        strip_timestamp(&sink.lines.lock()[0]),
        "Seq 4 L_Data low from 1.1.5 to 1/0/1, hop count 6, tpdu 00 81: GroupValue_Write 01"
    );
}

#[test]
fn undecodable_frame_has_envelope_only() {
    let (session, probe, sink) = session(true);
    session.start().unwrap();

    let mut corrupt = group_write();
    corrupt[8] ^= 0x55;
    probe.deliver(&busmon(0x03, &corrupt));
    assert!(wait_until(|| !sink.lines.lock().is_empty()));
    assert_eq!(strip_timestamp(&sink.lines.lock()[0]), "Seq 3");
}

#[test]
fn unformattable_frame_is_dropped_and_session_continues() {
    let (session, probe, sink) = session(true);
    session.start().unwrap();

    let mut no_apci = vec![0xBC, 0x11, 0x05, 0x08, 0x01, 0xE0, 0x00];
    no_apci.push(!no_apci.iter().fold(0u8, |acc, b| acc ^ b));
    probe.deliver(&busmon(0x01, &no_apci));
    probe.deliver(&busmon(0x02, &[0xCC]));

    assert!(wait_until(|| sink.lines.lock().len() == 1));
    assert_eq!(strip_timestamp(&sink.lines.lock()[0]), "Seq 2 ACK");
    assert_eq!(session.stats().frames_dropped, 1);
    assert_eq!(session.state(), MonitorState::Open);
}

#[test]
fn double_quit_tears_down_once() {
    let (session, probe, _) = session(true);
    session.start().unwrap();

    session.quit();
    session.quit();
    assert_eq!(session.state(), MonitorState::Closed);
    assert_eq!(session.handle().teardown_count(), 1);
    assert_eq!(probe.closes.load(Ordering::SeqCst), 1);
    assert_eq!(
        session.run().unwrap(),
        SessionOutcome::Closed {
            initiator: CloseInitiator::Client,
            reason: "user request".to_string(),
        }
    );
}

#[test]
fn concurrent_quit_tears_down_once() {
    let (session, probe, _) = session(true);
    session.start().unwrap();

    let barrier = Arc::new(Barrier::new(8));
    let threads: Vec<_> = (0..8)
        .map(|i| {
            let handle = session.handle();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                if i % 2 == 0 {
                    handle.quit();
                } else {
                    handle.cancel();
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    assert_eq!(session.handle().teardown_count(), 1);
    assert_eq!(probe.closes.load(Ordering::SeqCst), 1);
    assert!(session.handle().outcome().is_some());
}

#[test]
fn link_closure_ends_run() {
    let (session, probe, _) = session(true);
    session.start().unwrap();

    let core = probe.core();
    let closer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        core.close(CloseInitiator::Server, "server request");
    });

    let outcome = session.run().unwrap();
    closer.join().unwrap();
    assert_eq!(
        outcome,
        SessionOutcome::Closed {
            initiator: CloseInitiator::Server,
            reason: "server request".to_string(),
        }
    );
    assert_eq!(session.handle().teardown_count(), 1);
}

#[test]
fn silent_link_death_is_detected() {
    let (session, probe, _) = session(true);
    session.start().unwrap();

    // Link reports closed but never notifies
    probe.alive.store(false, Ordering::SeqCst);
    let started = Instant::now();
    let outcome = session.run().unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(matches!(
        outcome,
        SessionOutcome::Closed {
            initiator: CloseInitiator::Internal,
            ..
        }
    ));
    assert_eq!(probe.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn trigger_cancels_open_session() {
    let (session, _, _) = session(true);
    let trigger = TerminationTrigger::manual();
    let registration = trigger.register(session.handle());
    session.start().unwrap();

    let firing = trigger.clone();
    let fire = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        firing.fire();
        firing.fire();
    });

    assert_eq!(session.run().unwrap(), SessionOutcome::Cancelled);
    fire.join().unwrap();
    assert_eq!(session.state(), MonitorState::Closed);
    assert_eq!(session.handle().teardown_count(), 1);
    registration.deregister();
}

#[test]
fn trigger_fired_before_start_prevents_link() {
    let (session, probe, _) = session(true);
    let trigger = TerminationTrigger::manual();
    trigger.fire();
    let _registration = trigger.register(session.handle());

    session.start().unwrap();
    assert_eq!(probe.opened.load(Ordering::SeqCst), 0);
    assert_eq!(session.run().unwrap(), SessionOutcome::Cancelled);
}

#[test]
fn deregistered_session_is_not_cancelled() {
    let (session, _, _) = session(true);
    let trigger = TerminationTrigger::manual();
    trigger.register(session.handle()).deregister();
    session.start().unwrap();

    trigger.fire();
    assert_eq!(session.state(), MonitorState::Open);
}

#[test]
fn construction_failure_is_reported() {
    let session = MonitorSession::with_factory(
        Configuration::ip("192.0.2.1", 3671),
        Arc::new(|_: &Configuration| -> Result<Box<dyn MonitorLink>, LinkError> {
            Err(LinkError::ConnectionFailed("refused".to_string()))
        }),
        Arc::new(MemorySink::default()),
    );

    let err = session.start().unwrap_err();
    assert!(matches!(err, SessionError::Link(LinkError::ConnectionFailed(_))));
    assert_eq!(session.state(), MonitorState::Closed);
    assert_eq!(session.handle().teardown_count(), 0);
}

#[test]
fn dropping_session_closes_link() {
    let (session, probe, _) = session(true);
    session.start().unwrap();
    drop(session);
    assert_eq!(probe.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn help_and_version_need_no_session() {
    for tokens in [
        vec!["-help"],
        vec!["-h", "-serial"],
        vec!["-version", "host1", "host2"],
        vec!["-verbose", "-version"],
    ] {
        assert!(matches!(
            parse_args(&tokens),
            Ok(Options::Help | Options::Version)
        ));
    }
}
