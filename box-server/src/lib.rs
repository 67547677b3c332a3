pub mod app_state;
pub mod box_controller;
pub mod engine;
pub mod incoming_controller;
pub mod outgoing_controller;
pub mod poll_worker;
pub mod push_worker;
pub mod receive;
pub mod supervisor;
pub mod token;
