//! Navigation requests sent to the frontend.
//!
//! The frontend owns the screens and popups; this side only asks for them.
//! Events are serialized the same way the frontend receives every other
//! backend event: `{ "type": "...", ...payload }`.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Screen {
    #[serde(rename = "clientlist")]
    ClientList,
    #[serde(rename = "receipt")]
    Receipt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "popup")]
pub enum Popup {
    /// Blocking question; confirming navigates to `confirm_screen`.
    #[serde(rename = "confirm")]
    Confirm {
        title: String,
        body: String,
        confirm_screen: Option<Screen>,
    },
    #[serde(rename = "error")]
    Error { title: String, body: String },
    /// Error with backend-supplied detail shown as a traceback.
    #[serde(rename = "error-traceback")]
    ErrorTraceback { title: String, body: String },
}

impl Popup {
    pub fn title(&self) -> &str {
        match self {
            Self::Confirm { title, .. }
            | Self::Error { title, .. }
            | Self::ErrorTraceback { title, .. } => title,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiEvent {
    ShowScreen { screen: Screen },
    ShowPopup { popup: Popup },
}

pub trait Gui: Send + Sync {
    fn show_screen(&self, screen: Screen);
    fn show_popup(&self, popup: Popup);
}

/// Forwards navigation requests to the frontend over a channel.
#[derive(Clone)]
pub struct EventGui {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl EventGui {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: UiEvent) {
        debug!(?event, "ui event");
        if self.tx.send(event).is_err() {
            warn!("ui event dropped: frontend receiver closed");
        }
    }
}

impl Gui for EventGui {
    fn show_screen(&self, screen: Screen) {
        self.emit(UiEvent::ShowScreen { screen });
    }

    fn show_popup(&self, popup: Popup) {
        self.emit(UiEvent::ShowPopup { popup });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_names() {
        let screen = serde_json::to_value(UiEvent::ShowScreen {
            screen: Screen::ClientList,
        })
        .unwrap();
        assert_eq!(screen, json!({ "type": "show_screen", "screen": "clientlist" }));

        let popup = serde_json::to_value(UiEvent::ShowPopup {
            popup: Popup::ErrorTraceback {
                title: "X".to_string(),
                body: "trace".to_string(),
            },
        })
        .unwrap();
        assert_eq!(popup["popup"]["popup"], "error-traceback");
        assert_eq!(popup["popup"]["title"], "X");
    }

    #[test]
    fn test_event_gui_forwards_in_order() {
        let (gui, mut rx) = EventGui::channel();
        gui.show_popup(Popup::Error {
            title: "t".to_string(),
            body: "b".to_string(),
        });
        gui.show_screen(Screen::Receipt);

        assert!(matches!(rx.try_recv().unwrap(), UiEvent::ShowPopup { .. }));
        assert_eq!(
            rx.try_recv().unwrap(),
            UiEvent::ShowScreen {
                screen: Screen::Receipt
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_receiver_is_not_fatal() {
        let (gui, rx) = EventGui::channel();
        drop(rx);
        gui.show_screen(Screen::Receipt);
    }
}
