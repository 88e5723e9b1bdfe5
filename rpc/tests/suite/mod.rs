mod cancellation;
mod tail_call;
mod two_party;
