#![forbid(unsafe_code)]

use std::time::Duration;

use parley_client_core::{
	CallCoordinator, CallPeer, CoordinatorError, IncomingCall, IncomingDecision, TabChannel, TabMessage,
};
use parley_domain::{MediaKind, RejectReason, RoomId, UserId};
use parley_protocol::{ClientEvent, ServerEvent};

fn uid(s: &str) -> UserId {
	UserId::new(s).unwrap()
}

fn incoming(caller: &str) -> IncomingCall {
	IncomingCall {
		caller: uid(caller),
		caller_name: caller.to_uppercase(),
		media: MediaKind::Video,
		room: None,
	}
}

fn busy_reply(caller: &str) -> IncomingDecision {
	IncomingDecision::Busy(ClientEvent::CallReject {
		caller: uid(caller),
		reason: Some(RejectReason::Busy),
		from: None,
	})
}

#[test]
fn second_tab_rejects_calls_while_first_tab_is_in_a_call() {
	let channel = TabChannel::default();
	let mut tab1 = CallCoordinator::join(&channel);
	let mut tab2 = CallCoordinator::join(&channel);

	tab1.start_call(CallPeer::User(uid("bob")), MediaKind::Video).unwrap();
	assert!(tab1.owns_call());

	assert_eq!(tab2.on_incoming_call(incoming("carol")), busy_reply("carol"));
	assert!(tab2.active_call().is_some());
	assert!(!tab2.owns_call());

	tab1.end_call();
	assert_eq!(tab2.on_incoming_call(incoming("carol")), IncomingDecision::Ring);
}

#[test]
fn start_is_refused_when_a_sibling_holds_the_flag() {
	let channel = TabChannel::default();
	let mut tab1 = CallCoordinator::join(&channel);
	let mut tab2 = CallCoordinator::join(&channel);

	tab1.start_call(CallPeer::User(uid("bob")), MediaKind::Audio).unwrap();
	match tab2.start_call(CallPeer::User(uid("carol")), MediaKind::Audio) {
		Err(CoordinatorError::CallActive(active)) => {
			assert_eq!(active.owner, tab1.tab_id());
			assert_eq!(active.with, CallPeer::User(uid("bob")));
		}
		other => panic!("unexpected: {other:?}"),
	}
}

#[test]
fn a_ringing_tab_is_busy_for_a_second_caller() {
	let channel = TabChannel::default();
	let mut tab = CallCoordinator::join(&channel);
	assert_eq!(tab.on_incoming_call(incoming("bob")), IncomingDecision::Ring);
	assert_eq!(tab.on_incoming_call(incoming("carol")), busy_reply("carol"));
}

#[test]
fn accepting_in_one_tab_clears_the_prompt_elsewhere() {
	let channel = TabChannel::default();
	let mut tab1 = CallCoordinator::join(&channel);
	let mut tab2 = CallCoordinator::join(&channel);

	assert_eq!(tab1.on_incoming_call(incoming("bob")), IncomingDecision::Ring);
	assert_eq!(tab2.on_incoming_call(incoming("bob")), IncomingDecision::Ring);

	let reply = tab1.accept().unwrap();
	assert_eq!(
		reply,
		ClientEvent::CallAccept {
			caller: uid("bob"),
			from: None,
		}
	);
	assert!(tab1.owns_call());

	tab2.sync();
	assert!(tab2.ringing().is_none());
	assert_eq!(tab2.active_call().map(|a| a.owner), Some(tab1.tab_id()));
	assert_eq!(tab2.accept(), Err(CoordinatorError::NothingRinging));
}

#[test]
fn rejecting_clears_sibling_prompts_without_claiming_the_flag() {
	let channel = TabChannel::default();
	let mut tab1 = CallCoordinator::join(&channel);
	let mut tab2 = CallCoordinator::join(&channel);
	tab1.on_incoming_call(incoming("bob"));
	tab2.on_incoming_call(incoming("bob"));

	assert_eq!(
		tab2.reject().unwrap(),
		ClientEvent::CallReject {
			caller: uid("bob"),
			reason: Some(RejectReason::Declined),
			from: None,
		}
	);
	tab1.sync();
	assert!(tab1.ringing().is_none());
	assert!(!tab1.is_busy());
}

#[test]
fn late_tab_learns_the_active_call() {
	let channel = TabChannel::default();
	let mut tab1 = CallCoordinator::join(&channel);
	tab1.start_call(CallPeer::Room(RoomId::new("lobby").unwrap()), MediaKind::Video)
		.unwrap();

	let mut late = CallCoordinator::join(&channel);
	// tab1 answers the sync request the next time it looks at the channel.
	tab1.sync();
	late.sync();
	assert_eq!(late.active_call().map(|a| a.owner), Some(tab1.tab_id()));
	assert!(matches!(late.on_incoming_call(incoming("carol")), IncomingDecision::Busy(_)));
}

#[test]
fn hangup_releases_the_flag_for_everyone() {
	let channel = TabChannel::default();
	let mut tab1 = CallCoordinator::join(&channel);
	let mut tab2 = CallCoordinator::join(&channel);
	tab1.start_call(CallPeer::User(uid("bob")), MediaKind::Video).unwrap();
	tab2.sync();

	// Only the owner broadcasts the end.
	tab2.on_hangup();
	assert!(tab2.is_busy());

	tab1.on_hangup();
	assert!(tab1.active_call().is_none());
	assert!(!tab2.is_busy());
}

#[test]
fn group_requests_reply_with_group_events() {
	let channel = TabChannel::default();
	let mut tab1 = CallCoordinator::join(&channel);
	tab1.start_call(CallPeer::User(uid("bob")), MediaKind::Video).unwrap();

	let ev = ServerEvent::GroupCallRequest {
		room_id: RoomId::new("lobby").unwrap(),
		caller_id: uid("carol"),
		caller_name: "Carol".into(),
		media: MediaKind::Audio,
	};
	let call = IncomingCall::from_event(&ev).unwrap();
	assert_eq!(
		tab1.on_incoming_call(call),
		IncomingDecision::Busy(ClientEvent::GroupCallReject {
			room_id: RoomId::new("lobby").unwrap(),
			to: uid("carol"),
		})
	);
	assert!(IncomingCall::from_event(&ServerEvent::CallEnded { from: uid("bob") }).is_none());
}

#[tokio::test]
async fn recv_skips_own_messages() {
	let channel = TabChannel::default();
	let mut tab1 = CallCoordinator::join(&channel);
	let mut tab2 = CallCoordinator::join(&channel);

	let seen = tokio::time::timeout(Duration::from_secs(1), tab1.recv()).await.unwrap();
	assert_eq!(seen, Some(TabMessage::SyncRequest));

	tab1.start_call(CallPeer::User(uid("bob")), MediaKind::Video).unwrap();

	let got = tokio::time::timeout(Duration::from_secs(1), tab2.recv()).await.unwrap();
	assert!(matches!(got, Some(TabMessage::CallStarted(ref a)) if a.owner == tab1.tab_id()));
	assert!(tab2.active_call().is_some());
}
