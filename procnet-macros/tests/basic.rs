use procnet_macros::Passable;
use procnet_message::Message;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Passable, Clone, Copy)]
struct Vote {
    round: i32,
}

#[test]
fn basic() {
    let vote = Vote { round: 1 };
    let message: Message = (&vote).into();
    assert_eq!(message.get_tip(), "Vote");
    let ret: Vote = message.into();
    assert_eq!(ret.round, vote.round);
}
