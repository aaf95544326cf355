//! LeadDesk headless runner.
//!
//! Seeds an in-memory store from a JSON fixture (or a small built-in demo),
//! runs one dashboard session for a few sync cycles and prints the board and
//! the first lead's conversation as JSON.
//!
//! Usage: `leaddesk [fixture.json]`

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde::Deserialize;

use leaddesk_lib::config::load_config;
use leaddesk_lib::types::ConversationRow;
use leaddesk_lib::{DashboardSession, DeskConfig, Lead, MemoryStore, Message};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Fixture {
    #[serde(default)]
    stages: Vec<String>,
    #[serde(default)]
    leads: Vec<Lead>,
    #[serde(default)]
    conversations: Vec<ConversationRow>,
}

fn load_fixture(path: &Path) -> anyhow::Result<Fixture> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read fixture {}: {e}", path.display()))?;
    Ok(serde_json::from_str(&content)?)
}

fn demo_fixture() -> Fixture {
    let at = |h, m| Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).single();
    let mut conversations = Vec::new();
    if let (Some(inbound), Some(reply)) = (at(10, 0), at(10, 1)) {
        conversations.push(ConversationRow::from(&Message {
            id: "m-demo-1".into(),
            lead_id: "L1".into(),
            direction: leaddesk_lib::Direction::Inbound,
            text: "Hola, quiero información".into(),
            timestamp: inbound,
            author: None,
        }));
        conversations.push(ConversationRow::from(&Message {
            id: "m-demo-2".into(),
            lead_id: "L1".into(),
            direction: leaddesk_lib::Direction::Outbound,
            text: "¡Claro! ¿Qué te interesa?".into(),
            timestamp: reply,
            author: Some(leaddesk_lib::Author::Agent),
        }));
    }
    Fixture {
        stages: vec!["Contactado".into(), "Calificado".into(), "Cerrado".into()],
        leads: vec![Lead::new("L1"), Lead::new("L2").with_status("Contactado")],
        conversations,
    }
}

fn build_store(fixture: Fixture) -> anyhow::Result<MemoryStore> {
    let stages: Vec<&str> = fixture.stages.iter().map(String::as_str).collect();
    let store = MemoryStore::new().with_stages(&stages).with_leads(fixture.leads);
    for row in fixture.conversations {
        store.seed_message(Message::try_from(row)?);
    }
    Ok(store)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = load_config().unwrap_or_else(|e| {
        log::warn!("Config unavailable, using defaults: {}", e);
        DeskConfig::default()
    });

    let fixture = match std::env::args().nth(1) {
        Some(path) => load_fixture(Path::new(&path))?,
        None => demo_fixture(),
    };
    let store = build_store(fixture)?;

    let session = DashboardSession::new(Arc::new(store), config);
    session.start();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let first = session
        .board()
        .columns
        .iter()
        .flat_map(|c| c.leads.iter())
        .map(|l| l.id.clone())
        .next();
    if let Some(lead_id) = first {
        session.select_lead(&lead_id)?;
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    println!("{}", serde_json::to_string_pretty(&session.board())?);
    if let Some(timeline) = session.timeline() {
        println!("{}", serde_json::to_string_pretty(&timeline)?);
    }

    session.stop();
    Ok(())
}
