//! # LeaderKey Election
//!
//! Leader election on top of a [`Coordinator`](leaderkey_core::Coordinator).
//!
//! A [`Member`] competes for one lock key. While it holds the lock it is
//! the leader; losing the lock makes it a follower again and it goes back
//! to competing. Every change is delivered in order to `on_leader` /
//! `on_follower` callbacks or to a [`TransitionHandler`].
//!
//! This crate provides:
//! - [`Member`] and [`MemberBuilder`], the entry points
//! - [`ElectionLoop`], the acquisition state machine
//! - [`CallbackDispatcher`], the ordered relay to user code

pub mod dispatcher;
pub mod election;
pub mod member;

pub use dispatcher::{Callback, CallbackDispatcher, CallbackHandler, TransitionHandler};
pub use election::ElectionLoop;
pub use member::{Member, MemberBuilder, MemberState};

pub use leaderkey_consul::ConsulConfig;
pub use leaderkey_core::{
    CoordinatorError, LeaderKeyError, LeaderKeyResult, LockOptions, Membership,
    MembershipTransition,
};
