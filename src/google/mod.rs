pub mod gcal;
pub mod oauth;
pub mod tokens;

pub use gcal::GoogleCalendarApi;
pub use tokens::GoogleTokenManager;
