use uuid::Uuid;

/// Sample User entity for testing
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub email: String,
}

impl User {
    pub fn new(email: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.to_string(),
        }
    }
}

/// Device registered to a user
#[derive(Debug, Clone, PartialEq)]
pub struct UserDevice {
    pub id: Uuid,
    pub user_id: Uuid,
    pub device_id: String,
}

impl UserDevice {
    pub fn new(user_id: Uuid, device_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            device_id: device_id.to_string(),
        }
    }
}
