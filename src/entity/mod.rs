pub mod email;
pub mod follow;
pub mod user;
pub mod user_profile;
