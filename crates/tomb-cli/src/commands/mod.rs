pub(crate) mod admin;
pub(crate) mod play;
pub(crate) mod serve;
