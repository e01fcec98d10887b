#![no_std]

pub mod config;
pub mod hart;
pub mod mem;
