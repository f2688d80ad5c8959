pub mod crash_dump;
