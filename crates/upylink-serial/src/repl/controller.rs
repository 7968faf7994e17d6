//! Session controller.
//!
//! Public operation surface of the device link: upload, stop, soft
//! reboot, raw control keys, arbitrary commands, file deletion, flash and
//! eject delegation.  Overlapping operations are dropped, not queued; a
//! single try-lock guards the serial line, and every surfaced error is
//! translated to its remedy message.

use crate::repl::classifier::OutputClassifier;
use crate::repl::connection::ConnectionManager;
use crate::repl::driver::ReplDriver;
use crate::repl::transfer::FileTransferEngine;
use crate::repl::transport::TransportFactory;
use crate::repl::types::{
    control, re, Command, ControlKey, FileRole, LinkConfig, UploadRequest, ENTRY_POINT_TARGET,
};
use std::sync::Arc;
use std::time::Duration;
use upylink_core::{LinkError, LinkResult, ProgressListener, ProgressUpdate, StatusSink};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Collaborator traits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Copies a firmware image onto the device volume.  Platform glue, out
/// of protocol scope; injected by the embedding application.
#[async_trait::async_trait]
pub trait FirmwareFlasher: Send + Sync {
    async fn flash(&self, status: Arc<dyn StatusSink>) -> LinkResult<()>;
}

/// Ejects the device drive via the host operating system.
#[async_trait::async_trait]
pub trait DriveEjector: Send + Sync {
    async fn eject(&self) -> LinkResult<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Operations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything the controller can be asked to do.
#[derive(Debug, Clone)]
pub enum Operation {
    /// Interrupt twice, then execute: reruns the entry-point program.
    SoftReboot,
    /// Interrupt only.
    Stop,
    ClosePort,
    UploadFile(UploadRequest),
    Flash,
    SendControl(ControlKey),
    /// Execute one arbitrary interpreter command.
    SendCommand(String),
    DeleteAllFiles,
    EjectDevice,
}

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationOutcome {
    Completed,
    /// The operation failed; the remedy went to the status sink.
    Failed,
    /// Another operation holds the lock; this one was dropped.
    Busy,
}

/// Delete-everything loop sent to the interpreter.
pub fn build_delete_all_commands() -> Vec<Command> {
    ["import os", "l=os.listdir()", "for f in l:", "    os.remove(f)"]
        .into_iter()
        .map(Command::bare)
        .collect()
}

/// Delete loop sparing the named files.
pub fn build_delete_commands(exclude: &[String]) -> Vec<Command> {
    let list = exclude
        .iter()
        .map(|name| format!("\"{name}\""))
        .collect::<Vec<_>>()
        .join(",");
    vec![
        Command::bare("import os"),
        Command::bare("l=os.listdir()"),
        Command::bare("for f in l:"),
        Command::bare(format!("    if not(f in [{list}]):")),
        Command::bare("        os.remove(f)"),
    ]
}

/// Remove a single file.
pub fn build_delete_file_commands(name: &str) -> Vec<Command> {
    vec![
        Command::bare("import os"),
        Command::bare(format!("os.remove(\"{name}\")")),
    ]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Controller
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Composes the link components behind a single-operation surface.
pub struct SessionController {
    classifier: Arc<OutputClassifier>,
    conn: Arc<ConnectionManager>,
    driver: Arc<ReplDriver>,
    transfer: FileTransferEngine,
    lock: tokio::sync::Mutex<()>,
    listeners: std::sync::Mutex<Vec<Arc<dyn ProgressListener>>>,
    flasher: Option<Arc<dyn FirmwareFlasher>>,
    ejector: Option<Arc<dyn DriveEjector>>,
}

impl SessionController {
    pub fn new(
        config: LinkConfig,
        factory: Arc<dyn TransportFactory>,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        let classifier = Arc::new(OutputClassifier::new(sink));
        classifier.enable_filtering();
        let conn = Arc::new(ConnectionManager::new(factory, classifier.clone()));
        let driver = Arc::new(ReplDriver::new(
            conn.clone(),
            classifier.clone(),
            config.clone(),
        ));
        let transfer = FileTransferEngine::new(driver.clone(), classifier.clone(), config);
        Self {
            classifier,
            conn,
            driver,
            transfer,
            lock: tokio::sync::Mutex::new(()),
            listeners: std::sync::Mutex::new(Vec::new()),
            flasher: None,
            ejector: None,
        }
    }

    pub fn with_flasher(mut self, flasher: Arc<dyn FirmwareFlasher>) -> Self {
        self.flasher = Some(flasher);
        self
    }

    pub fn with_ejector(mut self, ejector: Arc<dyn DriveEjector>) -> Self {
        self.ejector = Some(ejector);
        self
    }

    pub fn add_progress_listener(&self, listener: Arc<dyn ProgressListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.conn
    }

    pub fn classifier(&self) -> &Arc<OutputClassifier> {
        &self.classifier
    }

    /// The transfer engine, for callers that want the CRC-32 check.
    pub fn transfer(&self) -> &FileTransferEngine {
        &self.transfer
    }

    /// Run one operation.
    ///
    /// Invocations arriving while another operation is in flight are
    /// dropped.  Failures are presented through the status sink and the
    /// lock is released on every path.
    pub async fn run(&self, operation: Operation) -> OperationOutcome {
        let Ok(_guard) = self.lock.try_lock() else {
            log::debug!("operation dropped, another one is running: {operation:?}");
            return OperationOutcome::Busy;
        };
        match self.dispatch(operation).await {
            Ok(()) => OperationOutcome::Completed,
            Err(err) => {
                self.present_error(&err);
                OperationOutcome::Failed
            }
        }
    }

    async fn dispatch(&self, operation: Operation) -> LinkResult<()> {
        match operation {
            Operation::SoftReboot => self.soft_reboot().await,
            Operation::Stop => self.stop().await,
            Operation::ClosePort => self.close_port().await,
            Operation::UploadFile(request) => {
                let result = self.upload(request).await;
                self.classifier.enable_filtering();
                self.classifier.set_user_messages(true);
                self.notify(ProgressUpdate {
                    source_id: "upload".to_string(),
                    animating: false,
                });
                result
            }
            Operation::Flash => {
                let result = self.flash().await;
                self.classifier.set_user_messages(true);
                self.notify(ProgressUpdate {
                    source_id: "prep".to_string(),
                    animating: false,
                });
                result
            }
            Operation::SendControl(key) => self.send_control(key).await,
            Operation::SendCommand(command) => self.send_command(command).await,
            Operation::DeleteAllFiles => self.delete_all_files().await,
            Operation::EjectDevice => self.eject().await,
        }
    }

    fn present_error(&self, err: &LinkError) {
        log::error!("operation failed (code {}): {err}", err.code());
        self.classifier.report_error(err.remedy());
    }

    fn notify(&self, update: ProgressUpdate) {
        for listener in self.listeners.lock().unwrap().iter() {
            listener.refresh(&update);
        }
    }

    async fn write(&self, data: &[u8]) -> LinkResult<()> {
        self.conn
            .write(data)
            .await
            .map_err(|err| LinkError::CommandExecutionFailed {
                detail: err.to_string(),
            })
    }

    // ── Operations ────────────────────────────────────────────────

    async fn soft_reboot(&self) -> LinkResult<()> {
        self.conn.connect().await?;
        self.write(&[control::INTERRUPT]).await?;
        self.write(&[control::INTERRUPT]).await?;
        self.write(&[control::EXECUTE]).await?;
        Ok(())
    }

    async fn stop(&self) -> LinkResult<()> {
        self.conn.connect().await?;
        self.write(&[control::INTERRUPT]).await?;
        self.write(&[control::INTERRUPT]).await?;
        Ok(())
    }

    async fn close_port(&self) -> LinkResult<()> {
        self.conn.close().await?;
        self.classifier.message("Port has been closed.");
        Ok(())
    }

    /// Probe the interpreter with a round trip before relying on it.
    pub async fn check_micropython(&self) -> LinkResult<()> {
        let probe = Command::expect(
            "print(\"hello\")",
            re("hello$"),
            Duration::from_millis(1000),
            "timeOut",
        );
        self.driver
            .execute(vec![probe], false, false, None)
            .await
            .map_err(|_| LinkError::DeviceUnresponsive)
    }

    async fn upload(&self, request: UploadRequest) -> LinkResult<()> {
        self.classifier.clear();
        self.classifier.set_streaming(false);
        self.conn.connect().await?;
        self.write(&[control::RAW_EXIT]).await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.write(&[control::INTERRUPT]).await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.notify(ProgressUpdate {
            source_id: "upload".to_string(),
            animating: true,
        });
        self.check_micropython().await?;
        self.classifier
            .message(&format!("Uploading {}...", request.file_name));
        self.classifier.set_user_messages(false);
        let (target, soft_reboot) = match request.role {
            FileRole::EntryPoint => (ENTRY_POINT_TARGET.to_string(), true),
            FileRole::Module => (request.file_name.clone(), false),
        };
        self.transfer
            .put(&request.bytes, &request.file_name, &target, soft_reboot)
            .await
    }

    async fn flash(&self) -> LinkResult<()> {
        self.classifier.set_user_messages(false);
        self.notify(ProgressUpdate {
            source_id: "prep".to_string(),
            animating: true,
        });
        let Some(flasher) = &self.flasher else {
            return Err(LinkError::UnsupportedPlatform);
        };
        flasher.flash(self.classifier.sink()).await
    }

    async fn send_control(&self, key: ControlKey) -> LinkResult<()> {
        self.classifier.set_streaming(true);
        self.classifier.set_user_messages(true);
        self.conn.connect().await?;
        self.write(&[key.byte()]).await?;
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.classifier.enable_filtering();
        Ok(())
    }

    async fn send_command(&self, command: String) -> LinkResult<()> {
        self.classifier.set_streaming(true);
        self.classifier.set_user_messages(true);
        self.conn.connect().await?;
        self.driver
            .execute(vec![Command::bare(command)], false, false, None)
            .await?;
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(())
    }

    async fn delete_all_files(&self) -> LinkResult<()> {
        self.classifier.set_user_messages(false);
        self.conn.connect().await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let result = self
            .driver
            .execute(build_delete_all_commands(), false, true, None)
            .await;
        self.classifier.set_user_messages(true);
        result?;
        self.classifier
            .message("All files on the device have been deleted.");
        Ok(())
    }

    /// Delete every file on the device except the named ones.
    pub async fn delete_files(&self, exclude: &[String]) -> LinkResult<()> {
        self.driver
            .execute(build_delete_commands(exclude), false, true, None)
            .await
    }

    /// Delete one file on the device.
    pub async fn delete_file(&self, name: &str) -> LinkResult<()> {
        self.driver
            .execute(build_delete_file_commands(name), false, true, None)
            .await
    }

    async fn eject(&self) -> LinkResult<()> {
        self.classifier.message("Trying to eject the device drive...");
        let Some(ejector) = &self.ejector else {
            return Err(LinkError::UnsupportedPlatform);
        };
        ejector.eject().await?;
        self.classifier.message("Device drive has been ejected.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repl::transport::{SerialTransport, SimulatedFactory, SimulatedTransport};
    use std::sync::Arc;
    use upylink_core::BufferSink;

    fn controller(
        transport: Arc<SimulatedTransport>,
    ) -> (Arc<BufferSink>, SessionController) {
        let sink = Arc::new(BufferSink::new());
        let controller = SessionController::new(
            LinkConfig::default(),
            Arc::new(SimulatedFactory::single(transport)),
            sink.clone(),
        );
        (sink, controller)
    }

    #[test]
    fn test_delete_all_grammar() {
        let texts: Vec<String> = build_delete_all_commands()
            .into_iter()
            .map(|c| c.text)
            .collect();
        assert_eq!(
            texts,
            vec!["import os", "l=os.listdir()", "for f in l:", "    os.remove(f)"]
        );
    }

    #[test]
    fn test_delete_with_exclusions_grammar() {
        let exclude = vec!["main.py".to_string(), "lib.py".to_string()];
        let texts: Vec<String> = build_delete_commands(&exclude)
            .into_iter()
            .map(|c| c.text)
            .collect();
        assert_eq!(texts[3], "    if not(f in [\"main.py\",\"lib.py\"]):");
        assert_eq!(texts[4], "        os.remove(f)");
    }

    #[test]
    fn test_delete_single_file_grammar() {
        let texts: Vec<String> = build_delete_file_commands("old.py")
            .into_iter()
            .map(|c| c.text)
            .collect();
        assert_eq!(texts, vec!["import os", "os.remove(\"old.py\")"]);
    }

    #[tokio::test]
    async fn test_stop_sends_two_interrupts() {
        let transport = SimulatedTransport::new("/dev/ttyACM0");
        let (_sink, controller) = controller(transport.clone());
        let outcome = controller.run(Operation::Stop).await;
        assert_eq!(outcome, OperationOutcome::Completed);
        assert_eq!(transport.drain_tx().await, vec![0x03, 0x03]);
    }

    #[tokio::test]
    async fn test_soft_reboot_sends_interrupts_then_execute() {
        let transport = SimulatedTransport::new("/dev/ttyACM0");
        let (_sink, controller) = controller(transport.clone());
        let outcome = controller.run(Operation::SoftReboot).await;
        assert_eq!(outcome, OperationOutcome::Completed);
        assert_eq!(transport.drain_tx().await, vec![0x03, 0x03, 0x04]);
    }

    #[tokio::test]
    async fn test_send_control_key() {
        let transport = SimulatedTransport::new("/dev/ttyACM0");
        let (_sink, controller) = controller(transport.clone());
        let outcome = controller.run(Operation::SendControl(ControlKey::A)).await;
        assert_eq!(outcome, OperationOutcome::Completed);
        assert_eq!(transport.drain_tx().await, vec![0x01]);
    }

    #[tokio::test]
    async fn test_close_port_reports_to_sink() {
        let transport = SimulatedTransport::new("/dev/ttyACM0");
        let (sink, controller) = controller(transport.clone());
        controller.run(Operation::Stop).await;
        let outcome = controller.run(Operation::ClosePort).await;
        assert_eq!(outcome, OperationOutcome::Completed);
        assert!(sink.lines().contains(&" > Port has been closed.".to_string()));
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_busy_controller_drops_the_operation() {
        let transport = SimulatedTransport::new("/dev/ttyACM0");
        let (_sink, controller) = controller(transport);
        let _guard = controller.lock.try_lock().unwrap();
        let outcome = controller.run(Operation::Stop).await;
        assert_eq!(outcome, OperationOutcome::Busy);
    }

    #[tokio::test]
    async fn test_eject_without_collaborator_fails_with_remedy() {
        let transport = SimulatedTransport::new("/dev/ttyACM0");
        let (sink, controller) = controller(transport);
        let outcome = controller.run(Operation::EjectDevice).await;
        assert_eq!(outcome, OperationOutcome::Failed);
        assert_eq!(
            sink.errors(),
            vec![LinkError::UnsupportedPlatform.remedy().to_string()]
        );
    }

    #[tokio::test]
    async fn test_discovery_failure_surfaces_remedy() {
        let transport = SimulatedTransport::new("/dev/ttyACM0");
        let sink = Arc::new(BufferSink::new());
        let controller = SessionController::new(
            LinkConfig::default(),
            Arc::new(SimulatedFactory::with_candidates(transport, vec![])),
            sink.clone(),
        );
        let outcome = controller.run(Operation::Stop).await;
        assert_eq!(outcome, OperationOutcome::Failed);
        assert_eq!(
            sink.errors(),
            vec![LinkError::NoDeviceFound.remedy().to_string()]
        );
    }
}
