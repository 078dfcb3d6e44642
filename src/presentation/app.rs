use crate::domain::models::{AppEvent, BluetoothCommand};
use crate::infrastructure::bluetooth::service::ServiceHandle;
use crate::presentation::components::Components;
use crate::presentation::state::ScreenState;
use crate::presentation::theme::{self, BrutalistPalette};
use eframe::egui;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

pub struct BleCounterApp {
    pub(crate) bluetooth_tx: mpsc::UnboundedSender<BluetoothCommand>,
    pub(crate) event_rx: mpsc::UnboundedReceiver<AppEvent>,
    pub(crate) state: ScreenState,
    pub(crate) is_dark_mode: bool,
    closing: bool,
}

impl BleCounterApp {
    pub fn new(cc: &eframe::CreationContext<'_>, service: ServiceHandle) -> Self {
        theme::configure_neubrutalism(&cc.egui_ctx, false);

        Self {
            bluetooth_tx: service.commands,
            event_rx: service.events,
            state: ScreenState::default(),
            is_dark_mode: false,
            closing: false,
        }
    }

    fn send(&self, command: BluetoothCommand) {
        if self.bluetooth_tx.send(command).is_err() {
            warn!("Bluetooth service is gone; dropping {:?}", command);
        }
    }

    fn ui_connection_panel(&self, ui: &mut egui::Ui, palette: &BrutalistPalette) {
        Components::brutalist_card(ui, "Connection", |ui| {
            let (text, bg, fg) = palette.connection_banner(self.state.connection);
            Components::status_banner(ui, text, bg, fg);

            if let Some(device) = &self.state.device {
                ui.label(format!("Device: {}", device));
            }
            ui.label(format!("MTU: {}", self.state.mtu));
            ui.label(format!("Bond: {:?}", self.state.bond));

            ui.horizontal(|ui| {
                let scan = ui.add_enabled(self.state.can_scan(), egui::Button::new("Scan"));
                if scan.clicked() {
                    self.send(BluetoothCommand::StartScan);
                }
                if self.state.scanning {
                    ui.spinner();
                }
                if self.state.can_write() && ui.button("Disconnect").clicked() {
                    self.send(BluetoothCommand::Disconnect);
                }
            });
        });
    }

    fn ui_counter_panel(&self, ui: &mut egui::Ui) {
        Components::brutalist_card(ui, "Counter", |ui| {
            ui.vertical_centered(|ui| {
                Components::counter_display(ui, &self.state.counter_text());
                // Writes without a connection are dropped by the service.
                if ui.button("Add").clicked() {
                    self.send(BluetoothCommand::WriteTrigger);
                }
            });
        });
    }

    fn ui_status_line(&self, ui: &mut egui::Ui, palette: &BrutalistPalette) {
        if let Some(msg) = &self.state.status {
            let text = egui::RichText::new(&msg.message).color(palette.severity(msg.severity));
            if self.state.status_is_error() {
                ui.label(text.strong());
            } else {
                ui.label(text);
            }
        }
    }

    fn ui_toasts(&self, ctx: &egui::Context, palette: &BrutalistPalette) {
        if self.state.toasts().is_empty() {
            return;
        }
        egui::Area::new(egui::Id::new("toasts"))
            .anchor(egui::Align2::CENTER_BOTTOM, egui::vec2(0.0, -30.0))
            .show(ctx, |ui| {
                for toast in self.state.toasts() {
                    Components::toast(ui, &toast.message, palette.accent_yellow);
                }
            });
    }
}

impl eframe::App for BleCounterApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        let now = Instant::now();
        while let Ok(event) = self.event_rx.try_recv() {
            self.state.apply(event, now);
        }
        self.state.expire(now);

        if self.state.should_close(now) && !self.closing {
            info!("Closing: required permissions missing");
            self.closing = true;
            ctx.send_viewport_cmd(egui::ViewportCommand::Close);
        }

        ctx.request_repaint_after(Duration::from_millis(100));

        let palette = BrutalistPalette::new(self.is_dark_mode);

        egui::TopBottomPanel::top("top_panel").show(ctx, |ui| {
            egui::menu::bar(ui, |ui| {
                ui.label(egui::RichText::new("BLE Counter").strong());
                ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                    let switch_icon = if self.is_dark_mode {
                        "☀ Light"
                    } else {
                        "🌙 Dark"
                    };
                    if ui.button(switch_icon).clicked() {
                        self.is_dark_mode = !self.is_dark_mode;
                        theme::configure_neubrutalism(ctx, self.is_dark_mode);
                    }
                });
            });
        });

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.vertical_centered(|ui| {
                ui.set_max_width(480.0);
                ui.add_space(20.0);
                Components::heading(ui, "BLE Counter");
                ui.add_space(15.0);

                self.ui_connection_panel(ui, &palette);
                ui.add_space(15.0);
                self.ui_counter_panel(ui);
                ui.add_space(15.0);
                self.ui_status_line(ui, &palette);
            });
        });

        self.ui_toasts(ctx, &palette);
    }
}
