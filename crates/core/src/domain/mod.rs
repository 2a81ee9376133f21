pub mod action;
pub mod entity;
