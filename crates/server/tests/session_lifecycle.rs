//! Session lifecycle over the loopback transport with mock services

mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use voicebot_core::TurnRole;
use voicebot_pipeline::TaskState;
use voicebot_server::{ServerError, SessionState};
use voicebot_transport::{IceCandidate, LoopbackNegotiator, SessionDescription};

fn roles(turns: &[voicebot_core::Turn]) -> Vec<TurnRole> {
    turns.iter().map(|t| t.role).collect()
}

#[tokio::test]
async fn test_assistant_greets_first() {
    let llm = ScriptedLlm::new([Reply::text(&["Hello! ", "How can I help?"])]);
    let negotiator = Arc::new(LoopbackNegotiator::auto_connect());
    let endpoint = endpoint(&negotiator, MockFactory::new(llm.clone()), test_settings());

    let answer = endpoint.accept_offer(SessionDescription::offer("v=0")).await.unwrap();
    assert_eq!(answer.kind, "answer");
    assert!(!answer.sdp.is_empty());

    let session = endpoint.sessions().get(&answer.pc_id).unwrap();
    let peer = negotiator.take_peer(&answer.pc_id).unwrap();

    eventually("greeting turn", || session.context().len() == 3).await;

    let turns = session.context().snapshot();
    assert_eq!(roles(&turns), vec![TurnRole::System, TurnRole::System, TurnRole::Assistant]);
    assert_eq!(turns[0].content, "You are a helpful assistant. Keep answers short.");
    assert_eq!(turns[1].content, "Say hello.");
    assert_eq!(turns[2].content, "Hello! How can I help?");
    assert!(turns.windows(2).all(|w| w[0].sequence < w[1].sequence));

    // The model saw persona and greeting instruction only
    let calls = llm.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].len(), 2);

    assert_eq!(session.state(), SessionState::Active);
    let audio = tokio::time::timeout(Duration::from_secs(1), peer.recv_audio()).await.unwrap();
    assert!(audio.is_some());
}

#[tokio::test]
async fn test_user_turn_runs_model_on_full_history() {
    let llm = ScriptedLlm::new([Reply::text(&["Hi there."]), Reply::text(&["Nice to meet you."])]);
    let negotiator = Arc::new(LoopbackNegotiator::auto_connect());
    let endpoint = endpoint(&negotiator, MockFactory::new(llm.clone()), test_settings());

    let answer = endpoint.accept_offer(SessionDescription::offer("v=0")).await.unwrap();
    let session = endpoint.sessions().get(&answer.pc_id).unwrap();
    let peer = negotiator.take_peer(&answer.pc_id).unwrap();
    eventually("greeting turn", || session.context().len() == 3).await;

    peer.send_audio(speech(0)).await.unwrap();
    peer.send_audio(speech(1)).await.unwrap();
    peer.send_audio(silence(2)).await.unwrap();

    eventually("reply to the user", || session.context().len() == 5).await;

    let turns = session.context().snapshot();
    assert_eq!(turns[3].role, TurnRole::User);
    assert_eq!(turns[3].content, "hello");
    assert_eq!(turns[4].role, TurnRole::Assistant);
    assert_eq!(turns[4].content, "Nice to meet you.");

    let calls = llm.calls();
    assert_eq!(calls.len(), 2);
    let history: Vec<&str> = calls[1].iter().map(|t| t.content.as_str()).collect();
    assert_eq!(
        history,
        vec!["You are a helpful assistant. Keep answers short.", "Say hello.", "Hi there.", "hello"]
    );
}

#[tokio::test]
async fn test_silence_without_speech_adds_nothing() {
    let llm = ScriptedLlm::new([Reply::text(&["Hi there."])]);
    let negotiator = Arc::new(LoopbackNegotiator::auto_connect());
    let endpoint = endpoint(&negotiator, MockFactory::new(llm.clone()), test_settings());

    let answer = endpoint.accept_offer(SessionDescription::offer("v=0")).await.unwrap();
    let session = endpoint.sessions().get(&answer.pc_id).unwrap();
    let peer = negotiator.take_peer(&answer.pc_id).unwrap();
    eventually("greeting turn", || session.context().len() == 3).await;

    for seq in 0..5 {
        peer.send_audio(silence(seq)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(session.context().len(), 3);
    assert_eq!(llm.call_count(), 1);
}

#[tokio::test]
async fn test_disconnect_mid_generation_cancels() {
    let llm = ScriptedLlm::new([Reply::hang(&["Hello there, I am"])]);
    let negotiator = Arc::new(LoopbackNegotiator::auto_connect());
    let endpoint = endpoint(&negotiator, MockFactory::new(llm.clone()), test_settings());

    let answer = endpoint.accept_offer(SessionDescription::offer("v=0")).await.unwrap();
    let session = endpoint.sessions().get(&answer.pc_id).unwrap();
    let peer = negotiator.take_peer(&answer.pc_id).unwrap();

    eventually("generation to start", || llm.call_count() == 1).await;
    let task = session.task().expect("task is created on connect");
    assert_eq!(session.context().len(), 2);

    peer.disconnect("peer left").await;

    tokio::time::timeout(Duration::from_secs(2), session.wait_closed())
        .await
        .expect("session closes within the grace period");

    assert_eq!(task.state(), TaskState::Cancelled);
    assert_eq!(session.context().len(), 2);
    assert!(session.context().is_sealed());
    assert!(peer.is_closed());

    eventually("session removal", || endpoint.sessions().count() == 0).await;
    assert!(matches!(
        endpoint.update_session(&answer.pc_id, &[IceCandidate::new("candidate:1")]).await,
        Err(ServerError::Stale(_))
    ));
}

#[tokio::test]
async fn test_unknown_connection_is_not_found() {
    let negotiator = Arc::new(LoopbackNegotiator::new());
    let endpoint = endpoint(&negotiator, MockFactory::new(ScriptedLlm::new([])), test_settings());

    let result = endpoint.update_session("does-not-exist", &[]).await;
    assert!(matches!(result, Err(ServerError::NotFound(_))));
}

#[tokio::test]
async fn test_candidates_reach_transport() {
    let negotiator = Arc::new(LoopbackNegotiator::new());
    let endpoint = endpoint(&negotiator, MockFactory::new(ScriptedLlm::new([])), test_settings());

    let answer = endpoint.accept_offer(SessionDescription::offer("v=0")).await.unwrap();
    let peer = negotiator.take_peer(&answer.pc_id).unwrap();

    let candidates = [IceCandidate::new("candidate:1"), IceCandidate::new("candidate:2")];
    endpoint.update_session(&answer.pc_id, &candidates).await.unwrap();
    assert_eq!(peer.candidates(), candidates.to_vec());

    // Not connected yet: no task, only the persona turn
    let session = endpoint.sessions().get(&answer.pc_id).unwrap();
    assert_eq!(session.state(), SessionState::Connecting);
    assert!(session.task().is_none());
    assert_eq!(session.context().len(), 1);
}

#[tokio::test]
async fn test_construction_failure_closes_transport() {
    let negotiator = Arc::new(LoopbackNegotiator::auto_connect());
    let endpoint = endpoint(&negotiator, Arc::new(FailingFactory), test_settings());

    let answer = endpoint.accept_offer(SessionDescription::offer("v=0")).await.unwrap();
    let session = endpoint.sessions().get(&answer.pc_id).unwrap();
    let peer = negotiator.take_peer(&answer.pc_id).unwrap();

    tokio::time::timeout(Duration::from_secs(2), session.wait_closed())
        .await
        .expect("session closes after setup failure");

    assert!(peer.is_closed());
    assert!(session.task().is_none());
    assert_eq!(session.context().len(), 1);

    // Other sessions are unaffected
    let second = endpoint.accept_offer(SessionDescription::offer("v=0")).await;
    assert!(second.is_ok());
}

#[tokio::test]
async fn test_model_failure_ends_session() {
    let llm = ScriptedLlm::new([Reply::Fail("quota exceeded".to_string())]);
    let negotiator = Arc::new(LoopbackNegotiator::auto_connect());
    let endpoint = endpoint(&negotiator, MockFactory::new(llm), test_settings());

    let answer = endpoint.accept_offer(SessionDescription::offer("v=0")).await.unwrap();
    let session = endpoint.sessions().get(&answer.pc_id).unwrap();
    let peer = negotiator.take_peer(&answer.pc_id).unwrap();

    tokio::time::timeout(Duration::from_secs(2), session.wait_closed())
        .await
        .expect("session closes after pipeline failure");

    let task = session.task().unwrap();
    assert!(matches!(task.state(), TaskState::Failed(reason) if reason.contains("quota exceeded")));
    assert!(peer.is_closed());
}

#[tokio::test]
async fn test_barge_in_aborts_generation() {
    let llm = ScriptedLlm::new([Reply::hang(&["Sure thing. ", "Let me "]), Reply::text(&["Okay."])]);
    let negotiator = Arc::new(LoopbackNegotiator::auto_connect());
    let endpoint = endpoint(&negotiator, MockFactory::new(llm.clone()), test_settings());

    let answer = endpoint.accept_offer(SessionDescription::offer("v=0")).await.unwrap();
    let session = endpoint.sessions().get(&answer.pc_id).unwrap();
    let peer = negotiator.take_peer(&answer.pc_id).unwrap();

    // First sentence is spoken, the rest of the reply never arrives
    let audio = tokio::time::timeout(Duration::from_secs(2), peer.recv_audio()).await.unwrap();
    assert!(audio.is_some());
    assert_eq!(session.context().len(), 2);

    peer.send_audio(speech(0)).await.unwrap();

    eventually("interrupted reply to be committed", || session.context().len() == 3).await;
    let interrupted = session.context().last().unwrap();
    assert_eq!(interrupted.role, TurnRole::Assistant);
    assert_eq!(interrupted.content, "Sure thing.");
    assert!(peer.flushes() >= 1);

    peer.send_audio(silence(1)).await.unwrap();
    eventually("reply to the user", || session.context().len() == 5).await;

    let turns = session.context().snapshot();
    assert_eq!(turns[3].content, "hello");
    assert_eq!(turns[4].content, "Okay.");
    assert_eq!(llm.call_count(), 2);
}

#[tokio::test]
async fn test_capacity_rejects_extra_offers() {
    let mut settings = test_settings();
    settings.server.max_sessions = 1;
    let negotiator = Arc::new(LoopbackNegotiator::new());
    let endpoint = endpoint(&negotiator, MockFactory::new(ScriptedLlm::new([])), settings);

    endpoint.accept_offer(SessionDescription::offer("v=0")).await.unwrap();
    let second = endpoint.accept_offer(SessionDescription::offer("v=0")).await;
    assert!(matches!(second, Err(ServerError::Capacity(1))));
}

#[tokio::test]
async fn test_invalid_offer_is_rejected() {
    let negotiator = Arc::new(LoopbackNegotiator::new());
    let endpoint = endpoint(&negotiator, MockFactory::new(ScriptedLlm::new([])), test_settings());

    let result = endpoint.accept_offer(SessionDescription::answer("v=0")).await;
    assert!(matches!(result, Err(ServerError::InvalidOffer(_))));
    assert_eq!(endpoint.sessions().count(), 0);
}

#[tokio::test]
async fn test_close_all_tears_down_every_session() {
    let llm = ScriptedLlm::new([Reply::hang(&["Hold on"]), Reply::hang(&["Hold on"])]);
    let negotiator = Arc::new(LoopbackNegotiator::auto_connect());
    let endpoint = endpoint(&negotiator, MockFactory::new(llm.clone()), test_settings());

    let first = endpoint.accept_offer(SessionDescription::offer("v=0")).await.unwrap();
    let second = endpoint.accept_offer(SessionDescription::offer("v=0")).await.unwrap();
    let a = endpoint.sessions().get(&first.pc_id).unwrap();
    let b = endpoint.sessions().get(&second.pc_id).unwrap();
    eventually("both generations", || llm.call_count() == 2).await;

    tokio::time::timeout(Duration::from_secs(2), endpoint.close_all())
        .await
        .expect("close_all finishes within the grace period");

    assert_eq!(a.state(), SessionState::Closed);
    assert_eq!(b.state(), SessionState::Closed);
    assert!(a.context().is_sealed() && b.context().is_sealed());
    assert_eq!(endpoint.sessions().count(), 0);
}

#[tokio::test]
async fn test_create_session_invokes_callback() {
    let negotiator = Arc::new(LoopbackNegotiator::new());
    let endpoint = endpoint(&negotiator, MockFactory::new(ScriptedLlm::new([])), test_settings());

    let (tx, rx) = tokio::sync::oneshot::channel();
    let answer = endpoint
        .create_session(SessionDescription::offer("v=0"), move |session, _events| {
            let _ = tx.send(session.id().to_string());
        })
        .await
        .unwrap();

    assert_eq!(rx.await.unwrap(), answer.pc_id);
}
