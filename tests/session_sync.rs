use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;

use leaddesk_lib::{
    Author, BucketKey, DashboardSession, DeskConfig, DeskSignal, Direction, HandoffState, Lead,
    LeadPatch, MemoryStore, SyncError,
};

fn config(board_poll_ms: u64, push_enabled: bool) -> DeskConfig {
    DeskConfig {
        board_poll_ms,
        timeline_poll_ms: 0,
        push_enabled,
        ..DeskConfig::default()
    }
}

async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

fn drain(rx: &mut broadcast::Receiver<DeskSignal>) -> Vec<DeskSignal> {
    let mut out = Vec::new();
    while let Ok(signal) = rx.try_recv() {
        out.push(signal);
    }
    out
}

fn pipeline() -> MemoryStore {
    MemoryStore::new()
        .with_stages(&["Contactado", "Calificado"])
        .with_leads(vec![
            Lead::new("L1"),
            Lead::new("L2").with_status("Contactado"),
            Lead::new("L3"),
        ])
}

async fn open(store: &MemoryStore, config: DeskConfig) -> DashboardSession {
    let session = DashboardSession::new(Arc::new(store.clone()), config);
    session.start();
    settle().await;
    session
}

#[tokio::test(start_paused = true)]
async fn test_unclassified_lead_moves_and_failed_move_reverts() {
    let store = pipeline();
    let session = open(&store, config(0, false)).await;
    let mut signals = session.subscribe();

    let board = session.board();
    assert_eq!(board.columns[0].title, "Sin estado");
    assert_eq!(board.lead_ids(&BucketKey::Unclassified), vec!["L1", "L3"]);

    session.move_lead("L1", "Contactado").await.unwrap();
    assert_eq!(store.lead("L1").unwrap().status.as_deref(), Some("Contactado"));
    assert_eq!(
        session.board().bucket_of("L1"),
        Some(&BucketKey::Stage("Contactado".into()))
    );

    store.fail_next_writes(1);
    let err = session.move_lead("L3", "Calificado").await.unwrap_err();
    assert!(err.is_reverted());
    assert_eq!(session.board().bucket_of("L3"), Some(&BucketKey::Unclassified));
    settle().await;
    assert_eq!(session.board().bucket_of("L3"), Some(&BucketKey::Unclassified));
    assert_eq!(session.board().total(), 3);

    assert!(drain(&mut signals)
        .iter()
        .any(|s| matches!(s, DeskSignal::WriteReverted { lead_id, .. } if lead_id == "L3")));
}

#[tokio::test(start_paused = true)]
async fn test_move_shows_destination_while_write_is_in_flight() {
    let store = pipeline();
    let session = open(&store, config(0, false)).await;

    store.pause_writes();
    let moving = session.move_lead("L1", "Contactado");
    let during = async {
        settle().await;
        let bucket = session.board().bucket_of("L1").cloned();
        assert_eq!(store.lead("L1").unwrap().status, None);
        store.resume_writes();
        bucket
    };
    let (moved, bucket) = tokio::join!(moving, during);
    moved.unwrap();
    assert_eq!(bucket, Some(BucketKey::Stage("Contactado".into())));

    // Same again for a write the store rejects.
    store.pause_writes();
    store.fail_next_writes(1);
    let moving = session.move_lead("L3", "Calificado");
    let during = async {
        settle().await;
        let bucket = session.board().bucket_of("L3").cloned();
        store.resume_writes();
        bucket
    };
    let (moved, bucket) = tokio::join!(moving, during);
    assert!(moved.is_err());
    assert_eq!(bucket, Some(BucketKey::Stage("Calificado".into())));
    assert_eq!(session.board().bucket_of("L3"), Some(&BucketKey::Unclassified));
}

#[tokio::test(start_paused = true)]
async fn test_repeated_reply_shows_twice_with_server_clock_ahead() {
    let store = pipeline();
    store.set_clock_offset(chrono::Duration::seconds(30));
    let session = open(&store, config(0, false)).await;
    session.take_over("L1").await.unwrap();
    session.select_lead("L1").unwrap();
    settle().await;

    session.send_message("L1", "ok").await.unwrap();
    settle().await;

    store.pause_writes();
    let second = session.send_message("L1", "ok");
    let during = async {
        settle().await;
        // A refresh while the second insert is stalled must not swallow it.
        let before = store.message_reads();
        session.select_lead("L1").unwrap();
        settle().await;
        assert!(store.message_reads() > before);
        let view = session.timeline().unwrap();
        store.resume_writes();
        view
    };
    let (sent, view) = tokio::join!(second, during);
    sent.unwrap();
    assert_eq!(view.messages.len(), 2);
    assert_eq!(view.pending, 1);

    settle().await;
    let view = session.timeline().unwrap();
    assert_eq!(view.messages.len(), 2);
    assert_eq!(view.pending, 0);
}

#[tokio::test(start_paused = true)]
async fn test_optimistic_reply_is_not_duplicated() {
    let store = pipeline();
    store.receive_inbound("L1", "Hola, ¿precios?", Utc::now() - chrono::Duration::minutes(1));
    // Server clock runs ahead of ours.
    store.set_clock_offset(chrono::Duration::seconds(30));

    let session = open(&store, config(0, false)).await;
    session.select_lead("L1").unwrap();
    settle().await;
    assert_eq!(session.timeline().unwrap().messages.len(), 1);

    session.take_over("L1").await.unwrap();
    let stored = session.send_message("L1", "Te paso la lista").await.unwrap();
    assert_eq!(stored.author, Some(Author::Operator));
    settle().await;

    let view = session.timeline().unwrap();
    assert_eq!(view.pending, 0);
    assert_eq!(view.messages.len(), 2);
    assert_eq!(view.messages[0].direction, Direction::Inbound);
    assert_eq!(view.messages[1].direction, Direction::Outbound);
    assert_eq!(view.messages[1].id, stored.id);
    assert_eq!(store.messages("L1").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_agent_controlled_lead_refuses_replies() {
    let store = pipeline();
    let session = open(&store, config(0, false)).await;
    session.select_lead("L2").unwrap();
    settle().await;

    assert_eq!(session.handoff("L2"), Some(HandoffState::AgentControlled));
    let err = session.send_message("L2", "hola").await.unwrap_err();
    assert_eq!(err, SyncError::HandoffRequired("L2".into()));
    assert!(store.messages("L2").is_empty());
    assert!(session.timeline().unwrap().messages.is_empty());

    session.take_over("L2").await.unwrap();
    assert_eq!(session.handoff("L2"), Some(HandoffState::OperatorControlled));
    session.send_message("L2", "hola").await.unwrap();
    assert_eq!(store.messages("L2").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_takeover_hands_back_to_agent() {
    let store = pipeline();
    let session = open(&store, config(0, false)).await;

    store.fail_next_writes(1);
    assert!(session.take_over("L1").await.is_err());
    assert_eq!(session.handoff("L1"), Some(HandoffState::AgentControlled));
    assert!(!store.lead("L1").unwrap().handoff_active);
}

#[tokio::test(start_paused = true)]
async fn test_switching_leads_discards_stale_conversation() {
    let store = pipeline();
    store.receive_inbound("L1", "mensaje de L1", Utc::now());
    store.receive_inbound("L2", "mensaje de L2", Utc::now());
    let session = open(&store, config(0, true)).await;

    store.pause_reads();
    session.select_lead("L1").unwrap();
    settle().await;
    session.select_lead("L2").unwrap();
    settle().await;
    store.resume_reads();
    settle().await;

    let view = session.timeline().unwrap();
    assert_eq!(view.lead_id, "L2");
    assert!(view.loaded);
    assert_eq!(view.messages.len(), 1);
    assert_eq!(view.messages[0].text, "mensaje de L2");
    // Board feed plus the open conversation's feed.
    assert_eq!(store.subscriber_count(), 2);

    session.deselect_lead();
    settle().await;
    assert_eq!(store.subscriber_count(), 1);
    assert!(session.timeline().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_deleted_lead_is_deselected() {
    let store = pipeline();
    let session = open(&store, config(0, false)).await;
    let mut signals = session.subscribe();
    session.select_lead("L3").unwrap();
    settle().await;

    store.external_delete("L3");
    session.refresh_board();
    settle().await;

    assert_eq!(session.selected(), None);
    assert!(session.draft().is_none());
    assert!(session.timeline().is_none());
    assert!(session.board().bucket_of("L3").is_none());
    assert!(drain(&mut signals)
        .iter()
        .any(|s| matches!(s, DeskSignal::LeadVanished { lead_id } if lead_id == "L3")));
}

#[tokio::test(start_paused = true)]
async fn test_failed_refresh_keeps_last_board() {
    let store = pipeline();
    let session = open(&store, config(0, false)).await;
    let mut signals = session.subscribe();

    store.fail_next_reads(1);
    session.refresh_board();
    settle().await;

    assert_eq!(session.board().total(), 3);
    assert!(drain(&mut signals)
        .iter()
        .any(|s| matches!(s, DeskSignal::TransientError { error } if error.is_retryable())));
}

#[tokio::test(start_paused = true)]
async fn test_agent_reply_arrives_over_change_feed() {
    let store = pipeline();
    let session = open(&store, config(0, true)).await;
    session.select_lead("L1").unwrap();
    settle().await;

    store.agent_reply("L1", "¡Hola! Soy el asistente", Utc::now());
    settle().await;

    let view = session.timeline().unwrap();
    assert_eq!(view.messages.len(), 1);
    assert_eq!(view.messages[0].author, Some(Author::Agent));
}

#[tokio::test(start_paused = true)]
async fn test_board_poll_picks_up_external_moves() {
    let store = pipeline();
    let session = open(&store, config(1000, false)).await;

    store.external_update("L2", &LeadPatch::status("Calificado"));
    settle().await;
    assert_eq!(
        session.board().bucket_of("L2"),
        Some(&BucketKey::Stage("Contactado".into()))
    );

    tokio::time::advance(Duration::from_millis(1000)).await;
    settle().await;
    assert_eq!(
        session.board().bucket_of("L2"),
        Some(&BucketKey::Stage("Calificado".into()))
    );
}

#[tokio::test(start_paused = true)]
async fn test_status_outside_stage_list_is_unclassified() {
    let store = pipeline().with_leads(vec![Lead::new("L9").with_status("Archivado")]);
    let session = open(&store, config(0, false)).await;
    assert_eq!(session.board().bucket_of("L9"), Some(&BucketKey::Unclassified));
    assert_eq!(session.lead("L9").unwrap().status.as_deref(), Some("Archivado"));
}
