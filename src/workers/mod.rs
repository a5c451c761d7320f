pub mod archiver;
pub mod control_loop;
pub mod game_worker;
pub mod matchmaker;
