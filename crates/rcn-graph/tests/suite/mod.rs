mod constructors;
mod cycles;
mod events;
mod export;
mod idempotence;
mod member_type;
mod methods;
mod stale;
mod user_loaded_type;
