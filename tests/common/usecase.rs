use pg_advisory_uow::{Context, TransactionResult, UnitOfWork};

use super::entities::{User, UserDevice};
use super::repositories::UserRepository;

/// Registers a user together with their first device, atomically.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegisterUser {
    users: UserRepository,
}

impl RegisterUser {
    /// Joins `uow`'s transaction when it already is one, otherwise runs in its own.
    pub async fn register(
        &self,
        uow: &UnitOfWork,
        ctx: &Context,
        email: &str,
        device_id: &str,
    ) -> TransactionResult<(User, UserDevice)> {
        uow.run_in_transaction(move |tx| async move {
            let user = self.users.create_user(&tx, ctx, email).await?;
            let device = self
                .users
                .create_user_device(&tx, ctx, user.id, device_id)
                .await?;
            Ok((user, device))
        })
        .await
    }
}
