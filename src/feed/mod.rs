pub mod mutation;
pub mod store;

pub use mutation::{InvalidTransition, MutationState};
pub use store::{FeedEntry, FeedSnapshot, FeedStore, ProvisionalPost, COMMENTS, HEARTS, POSTS};
