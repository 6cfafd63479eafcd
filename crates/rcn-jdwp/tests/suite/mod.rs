// Consolidated integration test suite for the JDWP client, run against the
// in-process mock VM.
mod client;
mod events;
