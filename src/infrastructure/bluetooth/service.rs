//! Bluetooth Service Module
//!
//! Owns the session and coordinates scanning, connection, counter access
//! and bonding. Commands from the screen and results from spawned tasks are
//! handled one at a time on the service's own thread, so session state has
//! a single writer.

use crate::domain::models::{
    AppEvent, BluetoothCommand, BondState, ConnectionState, DeviceHandle, MessageSeverity,
    PermissionGrant, ScanOutcome, StatusMessage, REQUIRED_PERMISSIONS,
};
use crate::domain::settings::BleSettings;
use crate::infrastructure::bluetooth::{
    backend::{BleBackend, GattConnection, ScanFilter},
    bonding::BondHandler,
    connection::{ConnectionStateMachine, Connector},
    error::{BleError, GattFailure, GattOperation},
    protocol,
    scanner::BleScanner,
    session::{Session, SessionEvent, Subscription},
};
use crate::infrastructure::permissions::{self, PermissionGate};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Identifiers and tuning for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub filter: ScanFilter,
    pub scan_timeout: Duration,
    pub counter_uuid: Uuid,
    pub trigger_uuid: Uuid,
    pub requested_mtu: u16,
    pub auto_connect: bool,
    pub trigger_value: Vec<u8>,
}

impl SessionConfig {
    pub fn from_settings(settings: &BleSettings) -> Self {
        Self {
            filter: ScanFilter::for_service(settings.service_uuid),
            scan_timeout: Duration::from_millis(settings.scan_timeout_ms),
            counter_uuid: settings.counter_char_uuid,
            trigger_uuid: settings.trigger_char_uuid,
            requested_mtu: settings.requested_mtu,
            auto_connect: settings.auto_connect,
            trigger_value: settings.trigger_value.clone(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            filter: ScanFilter::for_service(protocol::SERVICE_UUID),
            scan_timeout: protocol::scan_timeout(),
            counter_uuid: protocol::COUNTER_CHAR_UUID,
            trigger_uuid: protocol::TRIGGER_CHAR_UUID,
            requested_mtu: protocol::MAX_MTU,
            auto_connect: true,
            trigger_value: protocol::TRIGGER_VALUE.to_vec(),
        }
    }
}

/// The screen's end of a running service.
pub struct ServiceHandle {
    pub commands: mpsc::UnboundedSender<BluetoothCommand>,
    pub events: mpsc::UnboundedReceiver<AppEvent>,
}

/// Main Bluetooth service coordinating all BLE operations
pub struct BluetoothService {
    config: SessionConfig,
    session: Session,
    state_machine: ConnectionStateMachine,
    connector: Connector,
    scanner: Arc<BleScanner>,
    bonding: BondHandler,
    active_scan: Option<(u64, Subscription)>,
    scan_counter: u64,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    internal_tx: mpsc::UnboundedSender<SessionEvent>,
    internal_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
}

impl BluetoothService {
    pub fn new(
        backend: Arc<dyn BleBackend>,
        config: SessionConfig,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let scanner = BleScanner::new(backend.clone(), config.filter.clone(), config.scan_timeout);

        Self {
            session: Session::new(),
            state_machine: ConnectionStateMachine::new(),
            connector: Connector::new(backend.clone(), config.auto_connect),
            scanner: Arc::new(scanner),
            bonding: BondHandler::new(backend),
            active_scan: None,
            scan_counter: 0,
            event_sender,
            internal_tx,
            internal_rx: Some(internal_rx),
            config,
        }
    }

    /// Run the service on a dedicated thread with its own runtime.
    pub fn spawn(
        backend: Arc<dyn BleBackend>,
        permissions: Arc<dyn PermissionGate>,
        config: SessionConfig,
    ) -> std::io::Result<ServiceHandle> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        std::thread::Builder::new()
            .name("bluetooth".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("Failed to create tokio runtime for Bluetooth: {}", e);
                        let _ = event_tx.send(AppEvent::LogMessage(StatusMessage {
                            message: format!("Bluetooth unavailable: {}", e),
                            severity: MessageSeverity::Error,
                        }));
                        return;
                    }
                };

                runtime.block_on(async move {
                    let service = BluetoothService::new(backend, config, event_tx);
                    service.run(permissions.as_ref(), command_rx).await;
                });
            })?;

        Ok(ServiceHandle {
            commands: command_tx,
            events: event_rx,
        })
    }

    /// Check permissions, then serve commands until the screen goes away.
    pub async fn run(
        mut self,
        permissions: &dyn PermissionGate,
        mut commands: mpsc::UnboundedReceiver<BluetoothCommand>,
    ) {
        let Some(mut internal) = self.internal_rx.take() else {
            return;
        };

        let grants = permissions.request(&REQUIRED_PERMISSIONS).await;
        if !self.verify_permissions(&grants) {
            return;
        }

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = internal.recv() => self.handle_session_event(event),
            }
        }

        info!("Bluetooth service stopping");
        self.teardown();
    }

    fn verify_permissions(&self, grants: &[PermissionGrant]) -> bool {
        match permissions::verify(&REQUIRED_PERMISSIONS, grants) {
            Ok(()) => {
                info!("All required permissions granted");
                self.emit(AppEvent::PermissionsGranted);
                true
            }
            Err(denied) => {
                error!("{}", denied);
                self.emit(AppEvent::PermissionsDenied(denied.missing));
                false
            }
        }
    }

    fn handle_command(&mut self, command: BluetoothCommand) {
        debug!("Command: {:?}", command);
        match command {
            BluetoothCommand::StartScan => self.start_scan(),
            BluetoothCommand::WriteTrigger => self.write_trigger(),
            BluetoothCommand::Disconnect => self.disconnect(),
        }
    }

    fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::ScanFinished { scan, outcome } => self.on_scan_finished(scan, outcome),
            SessionEvent::StateChanged { epoch, state } => {
                if self.session.is_current(epoch) {
                    self.transition(state);
                }
            }
            SessionEvent::Connected { epoch, connection } => {
                if self.session.is_current(epoch) {
                    self.on_connected(connection);
                } else {
                    debug!("Dropping connection of a finished session");
                }
            }
            SessionEvent::ConnectionLost { epoch, error } => {
                if self.session.is_current(epoch) {
                    self.on_connection_lost(error);
                }
            }
            SessionEvent::ConnectionClosed { epoch } => {
                if self.session.is_current(epoch) {
                    self.reset_session();
                }
            }
            SessionEvent::MtuNegotiated { epoch, mtu } => {
                if self.session.is_current(epoch) {
                    self.session.set_mtu(mtu);
                    self.emit(AppEvent::MtuChanged(mtu));
                }
            }
            SessionEvent::BondingRequired { epoch, operation } => {
                if self.session.is_current(epoch) {
                    self.on_bonding_required(operation);
                }
            }
            SessionEvent::BondProgress { cycle, state } => {
                if self.bonding.is_current(cycle) {
                    self.emit(AppEvent::BondState(state));
                }
            }
            SessionEvent::BondFinished { cycle, state } => {
                if self.bonding.finish(cycle) {
                    self.on_bond_finished(state);
                }
            }
            SessionEvent::BondInitiationFailed { cycle, error } => {
                if self.bonding.finish(cycle) {
                    self.send_log(
                        &format!("Could not start pairing: {}", error),
                        MessageSeverity::Error,
                    );
                    self.emit(AppEvent::BondState(BondState::None));
                }
            }
        }
    }

    fn start_scan(&mut self) {
        if let Some((_, scan)) = self.active_scan.take() {
            info!("Restarting scan");
            scan.dispose();
        }

        self.scan_counter += 1;
        let id = self.scan_counter;
        let scanner = self.scanner.clone();
        let current = self.session.device().cloned();
        let events = self.internal_tx.clone();

        let task = Subscription::spawn("scan", async move {
            let outcome = scanner.find_device(current).await;
            let _ = events.send(SessionEvent::ScanFinished { scan: id, outcome });
        });
        self.active_scan = Some((id, task));

        self.emit(AppEvent::ScanStarted);
        self.send_log("Scanning for counter peripheral...", MessageSeverity::Info);
    }

    fn on_scan_finished(&mut self, scan: u64, outcome: ScanOutcome) {
        match &self.active_scan {
            Some((active, _)) if *active == scan => self.active_scan = None,
            _ => {
                debug!("Ignoring result of superseded scan {}", scan);
                return;
            }
        }

        self.emit(AppEvent::ScanFinished(outcome.clone()));
        match outcome {
            ScanOutcome::Selected(device) => self.start_connecting(device),
            ScanOutcome::NotFound => info!("No device found"),
            ScanOutcome::Failed(reason) => {
                self.send_log(&format!("Scan failed: {}", reason), MessageSeverity::Error)
            }
        }
    }

    fn start_connecting(&mut self, device: DeviceHandle) {
        self.reset_session();
        self.session.select_device(device.clone());
        let epoch = self.session.epoch();

        let observer = self
            .connector
            .observe_state(&device, epoch, self.internal_tx.clone());
        self.session.set_state_observer(observer);

        self.transition(ConnectionState::Connecting);
        let connection = self
            .connector
            .connect(&device, epoch, self.internal_tx.clone());
        self.session.set_connection_subscription(connection);

        self.send_log(
            &format!("Connecting to {}...", device),
            MessageSeverity::Info,
        );
    }

    fn on_connected(&mut self, connection: Arc<dyn GattConnection>) {
        self.session.attach_connection(connection.clone());
        self.transition(ConnectionState::Connected);
        if let Some(device) = self.session.device() {
            self.send_log(&format!("Connected to {}", device), MessageSeverity::Success);
        }

        let epoch = self.session.epoch();
        self.session.track(Subscription::spawn(
            "request-mtu",
            negotiate_mtu(
                connection.clone(),
                self.config.requested_mtu,
                epoch,
                self.internal_tx.clone(),
            ),
        ));
        self.session.track(Subscription::spawn(
            "read-counter",
            read_counter(
                connection.clone(),
                self.config.counter_uuid,
                epoch,
                self.internal_tx.clone(),
                self.event_sender.clone(),
            ),
        ));
        self.session.track(Subscription::spawn(
            "counter-notifications",
            watch_counter(
                connection,
                self.config.counter_uuid,
                self.event_sender.clone(),
            ),
        ));
    }

    fn on_connection_lost(&mut self, error: BleError) {
        let device = self
            .session
            .device()
            .map(|d| d.to_string())
            .unwrap_or_default();
        warn!("Connection to {} lost: {}", device, error);
        self.send_log(
            &format!("Device disconnected: {}", error),
            MessageSeverity::Error,
        );
        self.reset_session();
    }

    fn write_trigger(&mut self) {
        let Some(connection) = self.session.connection() else {
            warn!("Write requested without an active connection");
            return;
        };

        let epoch = self.session.epoch();
        self.session.track(Subscription::spawn(
            "write-trigger",
            write_trigger(
                connection,
                self.config.trigger_uuid,
                self.config.trigger_value.clone(),
                epoch,
                self.internal_tx.clone(),
            ),
        ));
    }

    fn on_bonding_required(&mut self, operation: GattOperation) {
        warn!("BLE requires bonding ({} rejected)", operation);
        let Some(device) = self.session.device().cloned() else {
            warn!("No selected device to bond with");
            return;
        };

        if self.bonding.start(&device, &self.internal_tx) {
            self.send_log(
                &format!("Pairing with {}...", device),
                MessageSeverity::Warning,
            );
        }
    }

    fn on_bond_finished(&mut self, state: BondState) {
        self.emit(AppEvent::BondState(state));
        match state {
            BondState::Bonded => {
                self.send_log("Paired. Try again.", MessageSeverity::Success)
            }
            _ => self.send_log("Pairing failed or was cleared", MessageSeverity::Warning),
        }
    }

    fn disconnect(&mut self) {
        if self.state_machine.state() == ConnectionState::Connected {
            self.transition(ConnectionState::Disconnecting);
        }
        self.reset_session();
        self.send_log("Disconnected from device", MessageSeverity::Info);
    }

    /// Single-connection invariant: everything of the previous session goes
    /// before anything of the next one starts.
    fn reset_session(&mut self) {
        self.session.reset();
        self.bonding.cancel();
        if matches!(
            self.state_machine.state(),
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Disconnecting
        ) {
            self.transition(ConnectionState::Disconnected);
        }
        self.emit(AppEvent::MtuChanged(self.session.mtu()));
    }

    fn teardown(&mut self) {
        if let Some((_, scan)) = self.active_scan.take() {
            scan.dispose();
        }
        self.reset_session();
    }

    fn transition(&mut self, state: ConnectionState) {
        if let Some(transition) = self.state_machine.apply(state) {
            self.emit(AppEvent::ConnectionState(transition.to));
        }
    }

    fn emit(&self, event: AppEvent) {
        let _ = self.event_sender.send(event);
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        self.emit(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

async fn negotiate_mtu(
    connection: Arc<dyn GattConnection>,
    requested: u16,
    epoch: u64,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    match connection.request_mtu(requested).await {
        Ok(mtu) => {
            info!("new MTU: {}", mtu);
            let _ = events.send(SessionEvent::MtuNegotiated { epoch, mtu });
        }
        Err(e) => error!("MTU request failed: {}", e),
    }
}

async fn read_counter(
    connection: Arc<dyn GattConnection>,
    uuid: Uuid,
    epoch: u64,
    events: mpsc::UnboundedSender<SessionEvent>,
    screen: mpsc::UnboundedSender<AppEvent>,
) {
    match connection.read_characteristic(uuid).await {
        Ok(value) => render_counter(&value, &screen),
        Err(error) => report_failure(GattOperation::Read, error, epoch, &events),
    }
}

async fn watch_counter(
    connection: Arc<dyn GattConnection>,
    uuid: Uuid,
    screen: mpsc::UnboundedSender<AppEvent>,
) {
    let mut values = match connection.setup_notification(uuid).await {
        Ok(values) => values,
        Err(e) => {
            error!("Failed to enable counter notifications: {}", e);
            return;
        }
    };

    while let Some(item) = values.next().await {
        match item {
            Ok(value) => render_counter(&value, &screen),
            Err(e) => {
                error!("Counter notification failed: {}", e);
                return;
            }
        }
    }
    info!("Counter notifications complete");
}

async fn write_trigger(
    connection: Arc<dyn GattConnection>,
    uuid: Uuid,
    value: Vec<u8>,
    epoch: u64,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    match connection.write_characteristic(uuid, &value).await {
        Ok(echo) => info!("write value: {:?}", echo.first()),
        Err(error) => report_failure(GattOperation::Write, error, epoch, &events),
    }
}

fn render_counter(value: &[u8], screen: &mpsc::UnboundedSender<AppEvent>) {
    match protocol::decode_counter(value) {
        Ok(count) => {
            info!("counter value: {}", count);
            let _ = screen.send(AppEvent::CounterValue(count));
        }
        Err(e) => warn!("Ignoring counter value: {}", e),
    }
}

fn report_failure(
    operation: GattOperation,
    error: BleError,
    epoch: u64,
    events: &mpsc::UnboundedSender<SessionEvent>,
) {
    match GattFailure::classify(error) {
        GattFailure::BondingRequired(error) => {
            warn!("Counter {} needs bonding: {}", operation, error);
            let _ = events.send(SessionEvent::BondingRequired { epoch, operation });
        }
        GattFailure::Other(error) => error!("Counter {} failed: {}", operation, error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Permission;
    use crate::infrastructure::bluetooth::simulated::{
        Advertisement, SimulatedBackend, SimulatedConfig,
    };
    use crate::infrastructure::permissions::StaticPermissionGate;

    const SETTLE: Duration = Duration::from_millis(50);

    fn device(address: u64) -> DeviceHandle {
        DeviceHandle::new(address, Some("BLE Counter".to_string()))
    }

    fn advertising(address: u64) -> Vec<Advertisement> {
        vec![Advertisement::counter(
            device(address),
            Duration::from_millis(1200),
        )]
    }

    fn open_peripheral() -> SimulatedConfig {
        SimulatedConfig {
            advertisements: advertising(1),
            requires_bonding: false,
            negotiated_mtu: Some(200),
            initial_count: 7,
            ..Default::default()
        }
    }

    struct Harness {
        backend: SimulatedBackend,
        commands: mpsc::UnboundedSender<BluetoothCommand>,
        events: mpsc::UnboundedReceiver<AppEvent>,
    }

    impl Harness {
        fn start(config: SimulatedConfig) -> Self {
            Self::start_with(config, StaticPermissionGate::granting_all())
        }

        fn start_with(config: SimulatedConfig, gate: StaticPermissionGate) -> Self {
            let backend = SimulatedBackend::new(config);
            let (event_tx, events) = mpsc::unbounded_channel();
            let (commands, command_rx) = mpsc::unbounded_channel();
            let service =
                BluetoothService::new(Arc::new(backend.clone()), SessionConfig::default(), event_tx);
            tokio::spawn(async move { service.run(&gate, command_rx).await });
            Self {
                backend,
                commands,
                events,
            }
        }

        fn send(&self, command: BluetoothCommand) {
            self.commands.send(command).unwrap();
        }

        async fn next_matching(&mut self, wanted: impl Fn(&AppEvent) -> bool) -> AppEvent {
            loop {
                let event = tokio::time::timeout(Duration::from_secs(60), self.events.recv())
                    .await
                    .expect("timed out waiting for event")
                    .expect("service stopped");
                if wanted(&event) {
                    return event;
                }
            }
        }

        async fn counter(&mut self) -> u8 {
            match self
                .next_matching(|e| matches!(e, AppEvent::CounterValue(_)))
                .await
            {
                AppEvent::CounterValue(value) => value,
                _ => unreachable!(),
            }
        }

        async fn connected(&mut self) {
            self.send(BluetoothCommand::StartScan);
            self.next_matching(|e| {
                matches!(e, AppEvent::ConnectionState(ConnectionState::Connected))
            })
            .await;
        }

        /// Let every spawned task run to its next wait and collect what
        /// reached the screen.
        async fn drain(&mut self) -> Vec<AppEvent> {
            tokio::time::sleep(SETTLE).await;
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_permission_stops_service() {
        let mut harness = Harness::start_with(
            open_peripheral(),
            StaticPermissionGate::denying(&[Permission::BluetoothAdmin]),
        );

        match harness.events.recv().await.unwrap() {
            AppEvent::PermissionsDenied(missing) => {
                assert_eq!(missing, vec![Permission::BluetoothAdmin])
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(harness.events.recv().await.is_none());
        assert!(harness.commands.send(BluetoothCommand::StartScan).is_err());
        assert_eq!(harness.backend.scan_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_granted_permissions_allow_scanning() {
        let mut harness = Harness::start(open_peripheral());
        assert!(matches!(
            harness.events.recv().await.unwrap(),
            AppEvent::PermissionsGranted
        ));
        harness.send(BluetoothCommand::StartScan);
        harness
            .next_matching(|e| matches!(e, AppEvent::ScanStarted))
            .await;
        assert_eq!(harness.backend.scan_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_connect_read_and_notify() {
        let mut harness = Harness::start(open_peripheral());
        harness.send(BluetoothCommand::StartScan);

        match harness
            .next_matching(|e| matches!(e, AppEvent::ScanFinished(_)))
            .await
        {
            AppEvent::ScanFinished(ScanOutcome::Selected(found)) => assert_eq!(found, device(1)),
            other => panic!("unexpected {:?}", other),
        }
        let (mut counter, mut mtu) = (None, None);
        while counter.is_none() || mtu.is_none() {
            match harness
                .next_matching(|e| {
                    matches!(e, AppEvent::CounterValue(_) | AppEvent::MtuChanged(200))
                })
                .await
            {
                AppEvent::CounterValue(value) => counter = Some(value),
                AppEvent::MtuChanged(value) => mtu = Some(value),
                _ => unreachable!(),
            }
        }
        assert_eq!(counter, Some(7));
        assert_eq!(mtu, Some(200));

        assert_eq!(harness.backend.connect_calls(), vec![(1, true)]);
        assert_eq!(harness.backend.mtu_requests(), vec![517]);

        harness.drain().await;
        harness.backend.push_counter(8);
        assert_eq!(harness.counter().await, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mtu_failure_keeps_default() {
        let mut harness = Harness::start(SimulatedConfig {
            negotiated_mtu: None,
            ..open_peripheral()
        });
        harness.connected().await;

        assert_eq!(harness.counter().await, 7);
        let events = harness.drain().await;
        assert!(!events
            .iter()
            .any(|e| matches!(e, AppEvent::MtuChanged(mtu) if *mtu != protocol::DEFAULT_MTU)));
        assert_eq!(harness.backend.mtu_requests(), vec![517]);

        harness.backend.push_counter(8);
        assert_eq!(harness.counter().await, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mtu_failure_leaves_session_mtu() {
        let backend = SimulatedBackend::new(SimulatedConfig {
            negotiated_mtu: None,
            ..open_peripheral()
        });
        let (event_tx, _events) = mpsc::unbounded_channel();
        let mut service =
            BluetoothService::new(Arc::new(backend.clone()), SessionConfig::default(), event_tx);
        let mut internal = service.internal_rx.take().unwrap();

        service.start_connecting(device(1));
        pump_until(&mut service, &mut internal, |s| s.session.is_connected()).await;
        tokio::time::sleep(SETTLE).await;
        while let Ok(event) = internal.try_recv() {
            service.handle_session_event(event);
        }

        assert_eq!(backend.mtu_requests(), vec![517]);
        assert_eq!(service.session.mtu(), protocol::DEFAULT_MTU);
        assert!(service.session.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_notification_error_ends_watch_without_resubscribing() {
        let mut harness = Harness::start(open_peripheral());
        harness.connected().await;
        assert_eq!(harness.counter().await, 7);
        harness.drain().await;

        harness
            .backend
            .fail_notifications(BleError::Platform("GATT_ERROR".to_string()));
        harness.drain().await;
        harness.backend.push_counter(9);

        let events = harness.drain().await;
        assert!(!events.iter().any(|e| matches!(e, AppEvent::CounterValue(_))));
        assert_eq!(harness.backend.notification_setups(), 1);
        assert_eq!(harness.backend.connected_address(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_device_reported_once() {
        let mut harness = Harness::start(SimulatedConfig {
            advertisements: Vec::new(),
            ..open_peripheral()
        });
        harness.send(BluetoothCommand::StartScan);

        tokio::time::sleep(Duration::from_millis(protocol::SCAN_TIMEOUT_MS + 1000)).await;
        let events = harness.drain().await;
        let not_found = events
            .iter()
            .filter(|e| matches!(e, AppEvent::ScanFinished(ScanOutcome::NotFound)))
            .count();
        assert_eq!(not_found, 1);
        assert!(harness.backend.connect_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_error_does_not_connect() {
        let mut harness = Harness::start(SimulatedConfig {
            advertisements: Vec::new(),
            scan_error: Some(BleError::ScanFailed("scan throttled".to_string())),
            ..open_peripheral()
        });
        harness.send(BluetoothCommand::StartScan);

        harness
            .next_matching(|e| matches!(e, AppEvent::ScanFinished(ScanOutcome::Failed(_))))
            .await;
        let events = harness.drain().await;
        assert!(!events
            .iter()
            .any(|e| matches!(e, AppEvent::ScanFinished(ScanOutcome::NotFound))));
        assert!(harness.backend.connect_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescan_skips_connected_device() {
        let mut harness = Harness::start(open_peripheral());
        harness.connected().await;

        harness.send(BluetoothCommand::StartScan);
        assert!(matches!(
            harness
                .next_matching(|e| matches!(e, AppEvent::ScanFinished(_)))
                .await,
            AppEvent::ScanFinished(ScanOutcome::NotFound)
        ));
        assert_eq!(harness.backend.connect_calls().len(), 1);
        assert_eq!(harness.backend.connected_address(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_access_error_bonds_without_retry() {
        let mut harness = Harness::start(SimulatedConfig {
            write_error: Some(BleError::CharacteristicAccess {
                uuid: protocol::TRIGGER_CHAR_UUID,
                reason: "insufficient authentication".to_string(),
            }),
            ..open_peripheral()
        });
        harness.connected().await;

        harness.send(BluetoothCommand::WriteTrigger);
        harness
            .next_matching(|e| matches!(e, AppEvent::BondState(BondState::Bonding)))
            .await;
        harness
            .next_matching(|e| matches!(e, AppEvent::BondState(BondState::Bonded)))
            .await;

        harness.drain().await;
        assert_eq!(harness.backend.bond_requests(), 1);
        assert_eq!(harness.backend.bond_observers(), 0);
        assert_eq!(harness.backend.write_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout_bonds() {
        let mut harness = Harness::start(SimulatedConfig {
            read_error: Some(BleError::Timeout("read".to_string())),
            ..open_peripheral()
        });
        harness.connected().await;

        harness
            .next_matching(|e| matches!(e, AppEvent::BondState(BondState::Bonded)))
            .await;
        assert_eq!(harness.backend.bond_requests(), 1);
        assert_eq!(harness.backend.read_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_failures_never_bond() {
        let mut harness = Harness::start(SimulatedConfig {
            read_error: Some(BleError::Platform("GATT_ERROR".to_string())),
            write_error: Some(BleError::Disconnected),
            ..open_peripheral()
        });
        harness.connected().await;

        harness.send(BluetoothCommand::WriteTrigger);
        let events = harness.drain().await;
        assert!(!events.iter().any(|e| matches!(e, AppEvent::BondState(_))));
        assert!(!events.iter().any(|e| matches!(e, AppEvent::CounterValue(_))));
        assert_eq!(harness.backend.write_count(), 1);
        assert_eq!(harness.backend.bond_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bonding_is_exclusive() {
        let mut harness = Harness::start(SimulatedConfig {
            requires_bonding: true,
            bond_outcome: None,
            ..open_peripheral()
        });
        harness.connected().await;
        harness
            .next_matching(|e| matches!(e, AppEvent::BondState(BondState::Bonding)))
            .await;

        harness.send(BluetoothCommand::WriteTrigger);
        harness.drain().await;
        assert_eq!(harness.backend.write_count(), 1);
        assert_eq!(harness.backend.bond_requests(), 1);
        assert_eq!(harness.backend.bond_observers(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_deregisters_pending_bond_observer() {
        let mut harness = Harness::start(SimulatedConfig {
            requires_bonding: true,
            bond_outcome: None,
            ..open_peripheral()
        });
        harness.connected().await;
        harness
            .next_matching(|e| matches!(e, AppEvent::BondState(BondState::Bonding)))
            .await;

        harness.send(BluetoothCommand::Disconnect);
        harness
            .next_matching(|e| {
                matches!(e, AppEvent::ConnectionState(ConnectionState::Disconnected))
            })
            .await;
        harness.drain().await;
        assert_eq!(harness.backend.bond_observers(), 0);
        assert_eq!(harness.backend.connected_address(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_clears_session_without_reconnect() {
        let mut harness = Harness::start(open_peripheral());
        harness.connected().await;

        harness.backend.drop_link(1);
        harness
            .next_matching(|e| {
                matches!(e, AppEvent::ConnectionState(ConnectionState::Disconnected))
            })
            .await;
        harness
            .next_matching(|e| matches!(e, AppEvent::MtuChanged(protocol::DEFAULT_MTU)))
            .await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(harness.backend.connect_calls().len(), 1);

        harness.send(BluetoothCommand::WriteTrigger);
        harness.drain().await;
        assert_eq!(harness.backend.write_count(), 0);
    }

    async fn pump_until(
        service: &mut BluetoothService,
        internal: &mut mpsc::UnboundedReceiver<SessionEvent>,
        done: impl Fn(&BluetoothService) -> bool,
    ) {
        while !done(service) {
            let event = tokio::time::timeout(Duration::from_secs(60), internal.recv())
                .await
                .expect("timed out")
                .expect("channel closed");
            service.handle_session_event(event);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_connection_resets_previous_session() {
        let backend = SimulatedBackend::new(open_peripheral());
        let (event_tx, _events) = mpsc::unbounded_channel();
        let mut service =
            BluetoothService::new(Arc::new(backend.clone()), SessionConfig::default(), event_tx);
        let mut internal = service.internal_rx.take().unwrap();

        service.start_connecting(device(1));
        pump_until(&mut service, &mut internal, |s| s.session.mtu() == 200).await;
        let first_epoch = service.session.epoch();
        assert!(service.session.is_connected());

        service.start_connecting(device(2));
        assert_eq!(service.session.mtu(), protocol::DEFAULT_MTU);
        assert!(!service.session.is_connected());
        assert_eq!(service.session.device(), Some(&device(2)));
        assert!(!service.session.is_current(first_epoch));

        pump_until(&mut service, &mut internal, |s| s.session.is_connected()).await;
        assert_eq!(backend.connected_address(), Some(2));
        assert_eq!(backend.connect_calls(), vec![(1, true), (2, true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_is_idempotent() {
        let backend = SimulatedBackend::new(open_peripheral());
        let (event_tx, _events) = mpsc::unbounded_channel();
        let mut service =
            BluetoothService::new(Arc::new(backend), SessionConfig::default(), event_tx);

        service.reset_session();
        service.reset_session();
        assert_eq!(service.session.mtu(), protocol::DEFAULT_MTU);
        assert!(service.session.device().is_none());
        assert!(!service.bonding.is_bonding());
        assert_eq!(service.state_machine.state(), ConnectionState::Idle);
    }
}
