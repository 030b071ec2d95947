//! Newline-delimited JSON commands accepted by the `analytics-relay` binary

use crate::services::consent::ConsentUpdate;
use crate::services::dispatcher::{Analytics, TrackOptions};
use crate::services::export::FlushOutcome;
use event_schema::Properties;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayCommand {
    Track {
        name: String,
        #[serde(default)]
        properties: Properties,
        #[serde(default)]
        fire_once: bool,
        fire_once_key: Option<String>,
        event_id: Option<String>,
    },
    Page {
        name: String,
        #[serde(default)]
        properties: Properties,
    },
    Conversion {
        conversion_type: String,
        event_id: String,
        #[serde(default)]
        properties: Properties,
    },
    Navigate {
        url: String,
        title: Option<String>,
    },
    Consent {
        action: ConsentAction,
        analytics: Option<bool>,
        marketing: Option<bool>,
    },
    PageHide,
    Flush,
    RetryFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentAction {
    AcceptAll,
    NecessaryOnly,
    Update,
    Withdraw,
    Reset,
}

/// One line of output per command
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayReply {
    pub command: &'static str,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl RelayCommand {
    pub fn name(&self) -> &'static str {
        match self {
            RelayCommand::Track { .. } => "track",
            RelayCommand::Page { .. } => "page",
            RelayCommand::Conversion { .. } => "conversion",
            RelayCommand::Navigate { .. } => "navigate",
            RelayCommand::Consent { .. } => "consent",
            RelayCommand::PageHide => "page_hide",
            RelayCommand::Flush => "flush",
            RelayCommand::RetryFailed => "retry_failed",
        }
    }
}

pub async fn apply(analytics: &Analytics, command: RelayCommand) -> RelayReply {
    let command_name = command.name();
    let reply = |accepted, detail: Option<String>| RelayReply {
        command: command_name,
        accepted,
        detail,
    };

    match command {
        RelayCommand::Track {
            name,
            properties,
            fire_once,
            fire_once_key,
            event_id,
        } => {
            let options = TrackOptions {
                fire_once,
                fire_once_key,
                event_id,
            };
            reply(analytics.track(&name, properties, options), None)
        }
        RelayCommand::Page { name, properties } => reply(analytics.page(&name, properties), None),
        RelayCommand::Conversion {
            conversion_type,
            event_id,
            properties,
        } => reply(
            analytics.conversion(&conversion_type, &event_id, properties),
            None,
        ),
        RelayCommand::Navigate { url, title } => {
            analytics.navigate(&url, title);
            reply(true, None)
        }
        RelayCommand::Consent {
            action,
            analytics: grant_analytics,
            marketing,
        } => {
            let consent = analytics.consent();
            match action {
                ConsentAction::AcceptAll => consent.accept_all(),
                ConsentAction::NecessaryOnly => consent.accept_necessary_only(),
                ConsentAction::Update => consent.update(ConsentUpdate {
                    analytics: grant_analytics,
                    marketing,
                }),
                ConsentAction::Withdraw => consent.withdraw(),
                ConsentAction::Reset => consent.reset(),
            }
            reply(true, None)
        }
        RelayCommand::PageHide => {
            analytics.on_page_hide();
            reply(true, None)
        }
        RelayCommand::Flush => {
            let outcome = analytics.flush().await;
            let delivered = matches!(
                outcome,
                FlushOutcome::Delivered { .. } | FlushOutcome::Empty
            );
            reply(delivered, Some(format!("{:?}", outcome)))
        }
        RelayCommand::RetryFailed => {
            let delivered = analytics.retry_failed_batches().await;
            reply(true, Some(format!("{} batches replayed", delivered)))
        }
    }
}
