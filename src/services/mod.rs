pub mod archive_service;
pub mod board_service;
pub mod challenge_service;
pub mod chat_service;
pub mod errors;
