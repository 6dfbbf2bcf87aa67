pub mod login;
pub mod session;

pub use login::{FormAction, LoginFlow, LoginForm};
pub use session::{Authenticated, NavigationTarget, SessionManager};
