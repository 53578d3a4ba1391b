use crate::{
    models::{
        teacher::{CreateTeacherRequest, UpdateTeacherRequest},
        user::UserRole,
    },
    services::teachers::TeacherService,
};

profile_handlers!(TeacherService, "teacher", UserRole::Teacher, CreateTeacherRequest, UpdateTeacherRequest);
