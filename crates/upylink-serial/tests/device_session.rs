//! End-to-end scenarios against a scripted fake device.
//!
//! The fake runs as a background task on the simulated transport: it
//! parses the host's byte stream into control bytes and CR-terminated
//! lines and answers the way a MicroPython board would.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use upylink_core::{BufferSink, LinkError, ProgressListener, ProgressUpdate};
use upylink_serial::{
    ControlKey, DeviceCandidate, FileRole, LinkConfig, Operation, OperationOutcome,
    SessionController, SimulatedFactory, SimulatedTransport, UploadRequest,
};

#[derive(Clone)]
struct DeviceBehaviour {
    free_memory: u32,
    answer_hello: bool,
    crc_token: Option<String>,
}

impl Default for DeviceBehaviour {
    fn default() -> Self {
        Self {
            free_memory: 20_000,
            answer_hello: true,
            crc_token: None,
        }
    }
}

/// Everything the host sent, as markers (`<ctrl-X>`) and lines.
type ReceivedLog = Arc<Mutex<Vec<String>>>;

fn spawn_fake_device(
    transport: Arc<SimulatedTransport>,
    behaviour: DeviceBehaviour,
) -> ReceivedLog {
    let received: ReceivedLog = Arc::new(Mutex::new(Vec::new()));
    let log = received.clone();
    tokio::spawn(async move {
        let mut acc: Vec<u8> = Vec::new();
        loop {
            let data = transport.next_tx().await;
            for byte in data {
                match byte {
                    0x01 => {
                        log.lock().unwrap().push("<ctrl-a>".to_string());
                        acc.clear();
                        reply(&transport, b"raw REPL; CTRL-B to exit\r\n").await;
                    }
                    0x02 => {
                        log.lock().unwrap().push("<ctrl-b>".to_string());
                        acc.clear();
                        reply(
                            &transport,
                            b"MicroPython v1.9.2 on 2017-10-11\r\nType \"help()\" for more information.\r\n",
                        )
                        .await;
                    }
                    0x03 => {
                        log.lock().unwrap().push("<ctrl-c>".to_string());
                        acc.clear();
                    }
                    0x04 => {
                        log.lock().unwrap().push("<ctrl-d>".to_string());
                        acc.clear();
                    }
                    b'\r' => {
                        let line = String::from_utf8_lossy(&acc).into_owned();
                        acc.clear();
                        if line.is_empty() {
                            continue;
                        }
                        log.lock().unwrap().push(line.clone());
                        respond_to_line(&transport, &line, &behaviour).await;
                    }
                    other => acc.push(other),
                }
            }
        }
    });
    received
}

/// Answer with a short latency, like a real board.
async fn reply(transport: &SimulatedTransport, data: &[u8]) {
    tokio::time::sleep(Duration::from_millis(10)).await;
    transport.inject_rx(data).await;
}

async fn respond_to_line(
    transport: &SimulatedTransport,
    line: &str,
    behaviour: &DeviceBehaviour,
) {
    if line == "print(\"hello\")" {
        if behaviour.answer_hello {
            reply(transport, b"hello\r\n").await;
        }
    } else if line.starts_with("f(b\"") {
        reply(transport, b"12\r\n").await;
    } else if line == "print(\"s\",gc.mem_free())" {
        let probe = format!("s {}\r\n", behaviour.free_memory);
        reply(transport, probe.as_bytes()).await;
    } else if line == "fd.close()" {
        reply(transport, b">>> fd.close()\r\n").await;
    } else if line.starts_with("c(i,") {
        if let Some(token) = &behaviour.crc_token {
            let answer = format!("{token}\r\n");
            reply(transport, answer.as_bytes()).await;
        }
    }
}

fn session(
    behaviour: DeviceBehaviour,
) -> (Arc<BufferSink>, ReceivedLog, SessionController) {
    let transport = SimulatedTransport::new("/dev/ttyACM0");
    let received = spawn_fake_device(transport.clone(), behaviour);
    let sink = Arc::new(BufferSink::new());
    let controller = SessionController::new(
        LinkConfig::default(),
        Arc::new(SimulatedFactory::single(transport)),
        sink.clone(),
    );
    (sink, received, controller)
}

fn lines_only(received: &ReceivedLog) -> Vec<String> {
    received
        .lock()
        .unwrap()
        .iter()
        .filter(|entry| !entry.starts_with("<ctrl-"))
        .cloned()
        .collect()
}

#[derive(Default)]
struct RecordingListener {
    updates: Mutex<Vec<ProgressUpdate>>,
}

impl ProgressListener for RecordingListener {
    fn refresh(&self, update: &ProgressUpdate) {
        self.updates.lock().unwrap().push(update.clone());
    }
}

// ── Scenarios ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_interpreter_probe_succeeds() {
    let (_sink, received, controller) = session(DeviceBehaviour::default());
    controller.check_micropython().await.unwrap();
    assert!(lines_only(&received).contains(&"print(\"hello\")".to_string()));
}

#[tokio::test]
async fn test_interpreter_probe_reports_unresponsive_device() {
    let (_sink, _received, controller) = session(DeviceBehaviour {
        answer_hello: false,
        ..DeviceBehaviour::default()
    });
    let err = controller.check_micropython().await.unwrap_err();
    assert_eq!(err, LinkError::DeviceUnresponsive);
}

#[tokio::test]
async fn test_upload_module_command_order() {
    let (sink, received, controller) = session(DeviceBehaviour::default());
    let listener = Arc::new(RecordingListener::default());
    controller.add_progress_listener(listener.clone());

    let request = UploadRequest {
        file_name: "data.py".to_string(),
        bytes: vec![b'a'; 200],
        role: FileRole::Module,
    };
    let outcome = controller.run(Operation::UploadFile(request)).await;
    assert_eq!(outcome, OperationOutcome::Completed);

    let lines = lines_only(&received);
    // Tail of the exchange: the transfer job after the gc preamble.
    let start = lines.iter().rposition(|l| l == "gc.collect()").unwrap();
    let tail = &lines[start + 1..];
    assert_eq!(tail[0], "import gc");
    assert_eq!(tail[1], "fd = open(\"data.py\", \"wb\")");
    assert_eq!(tail[2], "f = fd.write");
    // ceil(200 / 54) = 4 literal writes, a probe after the first window,
    // then the confirmed close. Nothing else.
    assert!(tail[3].starts_with("f(b\""));
    assert_eq!(tail[4], "print(\"s\",gc.mem_free())");
    assert!(tail[5].starts_with("f(b\""));
    assert!(tail[6].starts_with("f(b\""));
    assert!(tail[7].starts_with("f(b\""));
    assert_eq!(tail[8], "fd.close()");
    assert_eq!(tail.len(), 9);

    let status = sink.lines();
    assert!(status.contains(&" > Uploading data.py...".to_string()));
    assert!(status.contains(&" > data.py was successfully uploaded.".to_string()));

    let updates = listener.updates.lock().unwrap().clone();
    assert_eq!(
        updates,
        vec![
            ProgressUpdate {
                source_id: "upload".into(),
                animating: true
            },
            ProgressUpdate {
                source_id: "upload".into(),
                animating: false
            },
        ]
    );
}

#[tokio::test]
async fn test_upload_entry_point_targets_main_and_soft_reboots() {
    let (_sink, received, controller) = session(DeviceBehaviour::default());
    let request = UploadRequest {
        file_name: "robot.py".to_string(),
        bytes: b"while True:\n    pass\n".to_vec(),
        role: FileRole::EntryPoint,
    };
    let outcome = controller.run(Operation::UploadFile(request)).await;
    assert_eq!(outcome, OperationOutcome::Completed);

    let all = received.lock().unwrap().clone();
    assert!(all.contains(&"fd = open(\"main.py\", \"wb\")".to_string()));
    // The enter-key path fires the execute byte after the close.
    let close_at = all.iter().rposition(|l| l == "fd.close()").unwrap();
    assert!(
        all[close_at + 1..].contains(&"<ctrl-d>".to_string()),
        "soft reboot must follow the final close"
    );
}

#[tokio::test]
async fn test_upload_aborts_on_memory_overflow() {
    let (sink, received, controller) = session(DeviceBehaviour {
        free_memory: 4000,
        ..DeviceBehaviour::default()
    });
    let request = UploadRequest {
        file_name: "big.py".to_string(),
        bytes: vec![b'a'; 500],
        role: FileRole::Module,
    };
    let outcome = controller.run(Operation::UploadFile(request)).await;
    assert_eq!(outcome, OperationOutcome::Failed);

    let lines = lines_only(&received);
    let writes = lines.iter().filter(|l| l.starts_with("f(b\"")).count();
    assert_eq!(writes, 1, "no further chunks after the probe reported 4000");
    assert!(!lines.contains(&"fd.close()".to_string()));
    assert_eq!(
        sink.errors(),
        vec![LinkError::MemoryOverflow.remedy().to_string()]
    );
}

#[tokio::test]
async fn test_ambiguous_discovery_reports_remedy() {
    let transport = SimulatedTransport::new("/dev/ttyACM0");
    let candidates = vec![
        DeviceCandidate {
            path: "/dev/ttyACM0".into(),
            vendor_id: Some("0d28".into()),
            product_id: None,
            serial_number: None,
        },
        DeviceCandidate {
            path: "/dev/ttyACM1".into(),
            vendor_id: Some("0D28".into()),
            product_id: None,
            serial_number: None,
        },
    ];
    let sink = Arc::new(BufferSink::new());
    let controller = SessionController::new(
        LinkConfig::default(),
        Arc::new(SimulatedFactory::with_candidates(transport, candidates)),
        sink.clone(),
    );
    let outcome = controller.run(Operation::Stop).await;
    assert_eq!(outcome, OperationOutcome::Failed);
    assert_eq!(
        sink.errors(),
        vec![LinkError::AmbiguousDevice.remedy().to_string()]
    );
}

#[tokio::test]
async fn test_crc32_check_round_trip() {
    let (_sink, received, controller) = session(DeviceBehaviour {
        crc_token: Some("crc32data.pyT".to_string()),
        ..DeviceBehaviour::default()
    });
    controller
        .transfer()
        .crc32_check(b"payload bytes", "data.py")
        .await
        .unwrap();

    let lines = lines_only(&received);
    assert!(lines.contains(&"def c(data, crc_want, target):".to_string()));
    assert!(lines.contains(&"d=open('data.py','rb')".to_string()));
    let call = lines
        .iter()
        .find(|l| l.starts_with("c(i,'0x"))
        .expect("verification call with host-side checksum");
    assert!(call.ends_with("','data.py')"));
}

#[tokio::test]
async fn test_delete_all_files_sends_the_loop() {
    let (sink, received, controller) = session(DeviceBehaviour::default());
    let outcome = controller.run(Operation::DeleteAllFiles).await;
    assert_eq!(outcome, OperationOutcome::Completed);

    let lines = lines_only(&received);
    let at = lines.iter().position(|l| l == "l=os.listdir()").unwrap();
    assert_eq!(lines[at + 1], "for f in l:");
    assert_eq!(lines[at + 2], "    os.remove(f)");
    assert!(sink
        .lines()
        .contains(&" > All files on the device have been deleted.".to_string()));
}

#[tokio::test]
async fn test_send_command_executes_free_text() {
    let (_sink, received, controller) = session(DeviceBehaviour::default());
    let outcome = controller
        .run(Operation::SendCommand("display.show('x')".to_string()))
        .await;
    assert_eq!(outcome, OperationOutcome::Completed);
    assert!(lines_only(&received).contains(&"display.show('x')".to_string()));
}

#[tokio::test]
async fn test_control_key_send() {
    let (_sink, received, controller) = session(DeviceBehaviour::default());
    let outcome = controller.run(Operation::SendControl(ControlKey::C)).await;
    assert_eq!(outcome, OperationOutcome::Completed);
    assert_eq!(
        received.lock().unwrap().first(),
        Some(&"<ctrl-c>".to_string())
    );
}
