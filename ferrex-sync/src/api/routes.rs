macro_rules! v1_path {
    ($path:literal) => {
        concat!("/api/v1", $path)
    };
}

/// Versioned media server routes used by the synchronization core
pub mod v1 {
    pub const ROOT: &str = "/api/v1";
    pub const VERSION: &str = "v1";

    pub mod users {
        pub const VIEWS: &str = v1_path!("/users/{user_id}/views");
        pub const ITEMS: &str = v1_path!("/users/{user_id}/items");
        pub const ITEM: &str = v1_path!("/users/{user_id}/items/{id}");
        pub const RESUME: &str = v1_path!("/users/{user_id}/items/resume");
        pub const LATEST: &str = v1_path!("/users/{user_id}/items/latest");
        pub const NEXT_UP: &str = v1_path!("/users/{user_id}/shows/next-up");
    }

    /// POST marks, DELETE unmarks. Both answer with the item's user data.
    pub mod user_data {
        pub const FAVORITE: &str = v1_path!("/users/{user_id}/favorites/{id}");
        pub const PLAYED: &str = v1_path!("/users/{user_id}/played/{id}");
        pub const WATCHLIST: &str = v1_path!("/users/{user_id}/watchlist/{id}");
    }

    pub mod playback {
        pub const START: &str = v1_path!("/sessions/playing");
        pub const PROGRESS: &str = v1_path!("/sessions/playing/progress");
        pub const STOPPED: &str = v1_path!("/sessions/playing/stopped");
    }

    pub mod events {
        pub const SESSION: &str = v1_path!("/events/session");
    }
}

/// Substitute `{name}` placeholders in a route template.
pub fn fill(template: &str, params: &[(&str, &str)]) -> String {
    params
        .iter()
        .fold(template.to_string(), |route, (name, value)| {
            route.replace(&format!("{{{name}}}"), value)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_are_versioned_and_fillable() {
        assert!(v1::users::ITEM.starts_with(v1::ROOT));
        assert_eq!(
            fill(v1::user_data::FAVORITE, &[("user_id", "u1"), ("id", "m42")]),
            "/api/v1/users/u1/favorites/m42"
        );
    }
}
