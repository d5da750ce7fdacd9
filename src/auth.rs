/// What an authenticated connection may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Front-end service acting for members; may only cancel a requester's own
    /// reservations.
    Service,
    /// Staff; may cancel anyone's reservations and register machines.
    Admin,
}

impl Role {
    pub fn is_admin(self) -> bool {
        self == Role::Admin
    }
}

/// Shared-secret check for the first line of every connection.
#[derive(Debug, Clone)]
pub struct Authenticator {
    password: String,
    admin_password: Option<String>,
}

impl Authenticator {
    pub fn new(password: String, admin_password: Option<String>) -> Self {
        Self {
            password,
            admin_password,
        }
    }

    /// Role granted for `password`, if any. The admin secret wins when both match.
    pub fn authenticate(&self, password: &str) -> Option<Role> {
        if self.admin_password.as_deref() == Some(password) {
            Some(Role::Admin)
        } else if self.password == password {
            Some(Role::Service)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles() {
        let auth = Authenticator::new("member".into(), Some("staff".into()));
        assert_eq!(auth.authenticate("member"), Some(Role::Service));
        assert_eq!(auth.authenticate("staff"), Some(Role::Admin));
        assert_eq!(auth.authenticate("nope"), None);
        assert_eq!(auth.authenticate(""), None);
    }

    #[test]
    fn admin_disabled_without_secret() {
        let auth = Authenticator::new("member".into(), None);
        assert!(!auth.authenticate("member").unwrap().is_admin());
        assert_eq!(auth.authenticate("staff"), None);
    }
}
