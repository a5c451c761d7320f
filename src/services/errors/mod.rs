pub mod board_service_errors;
