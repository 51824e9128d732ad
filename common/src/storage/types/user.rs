use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(User, "user", {
    username: String,
    password: String,
    email: Option<String>,
    display_name: Option<String>,
    api_token: Option<String>
});

/// User shape returned by the API; never includes the password hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublicUser {
    pub id: String,
    pub username: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

impl User {
    /// Register a new user. The password is hashed inside SurrealDB with
    /// argon2; a bearer token is issued immediately.
    pub async fn create_new(
        username: String,
        password: String,
        email: Option<String>,
        display_name: Option<String>,
        db: &SurrealDbClient,
    ) -> Result<Self, AppError> {
        let id = Uuid::new_v4().to_string();
        let token = Uuid::new_v4().to_string();

        let result = db
            .query(
                "CREATE type::thing('user', $id) SET
                    username = $username,
                    password = crypto::argon2::generate($password),
                    email = $email,
                    display_name = $display_name,
                    api_token = $new_api_token,
                    created_at = time::now(),
                    updated_at = time::now()",
            )
            .bind(("id", id.clone()))
            .bind(("username", username.clone()))
            .bind(("password", password))
            .bind(("email", email))
            .bind(("display_name", display_name))
            .bind(("new_api_token", token))
            .await?;

        if let Err(err) = result.check() {
            // The unique index on username reports as a query error
            if err.to_string().contains("unique_username") {
                return Err(AppError::Validation(format!(
                    "Username '{username}' is already taken"
                )));
            }
            return Err(AppError::Database(err));
        }

        db.get_item::<User>(&id)
            .await?
            .ok_or_else(|| AppError::InternalError("User row missing after create".into()))
    }

    /// Check username/password and rotate the bearer token on success.
    pub async fn authenticate(
        username: &str,
        password: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM user
                 WHERE username = $username
                   AND crypto::argon2::compare(password, $password)",
            )
            .bind(("username", username.to_owned()))
            .bind(("password", password.to_owned()))
            .await?;

        let user: Option<User> = response.take(0)?;
        let Some(user) = user else {
            return Ok(None);
        };

        let token = Uuid::new_v4().to_string();
        let mut response = db
            .query(
                "UPDATE type::thing('user', $id)
                 SET api_token = $new_api_token, updated_at = time::now()
                 RETURN AFTER",
            )
            .bind(("id", user.id))
            .bind(("new_api_token", token))
            .await?;

        let updated: Option<User> = response.take(0)?;
        Ok(updated)
    }

    pub async fn find_by_api_token(
        token: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        let mut response = db
            .query("SELECT * FROM user WHERE api_token = $new_api_token")
            .bind(("new_api_token", token.to_owned()))
            .await?;

        let user: Option<User> = response.take(0)?;
        Ok(user)
    }

    pub fn public(&self) -> PublicUser {
        PublicUser {
            id: self.id.clone(),
            username: self.username.clone(),
            email: self.email.clone(),
            display_name: self.display_name.clone(),
        }
    }
}
