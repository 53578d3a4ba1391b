use crate::{
    models::{
        secretary::{CreateSecretaryRequest, UpdateSecretaryRequest},
        user::UserRole,
    },
    services::secretaries::SecretaryService,
};

profile_handlers!(SecretaryService, "secretary", UserRole::Secretary, CreateSecretaryRequest, UpdateSecretaryRequest);
