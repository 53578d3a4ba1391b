use crate::{
    models::academic::{
        AcademicListQuery, CreateAcademicYearRequest, CreateClassRoomRequest, CreateCourseRequest, CreateGradeRequest,
        UpdateAcademicYearRequest, UpdateClassRoomRequest, UpdateCourseRequest, UpdateGradeRequest,
    },
    services::academic::AcademicService,
};

managed_handlers! {
    AcademicService, "academic_year",
    list: list_years => list_years(AcademicListQuery),
    get: get_year => get_year,
    create: create_year => create_year(CreateAcademicYearRequest),
    update: update_year => update_year(UpdateAcademicYearRequest),
    toggle: deactivate_year, activate_year => set_year_active,
}

managed_handlers! {
    AcademicService, "grade",
    list: list_grades => list_grades(AcademicListQuery),
    get: get_grade => get_grade,
    create: create_grade => create_grade(CreateGradeRequest),
    update: update_grade => update_grade(UpdateGradeRequest),
    toggle: deactivate_grade, activate_grade => set_grade_active,
}

managed_handlers! {
    AcademicService, "course",
    list: list_courses => list_courses(AcademicListQuery),
    get: get_course => get_course,
    create: create_course => create_course(CreateCourseRequest),
    update: update_course => update_course(UpdateCourseRequest),
    toggle: deactivate_course, activate_course => set_course_active,
}

managed_handlers! {
    AcademicService, "class_room",
    list: list_class_rooms => list_class_rooms(AcademicListQuery),
    get: get_class_room => get_class_room,
    create: create_class_room => create_class_room(CreateClassRoomRequest),
    update: update_class_room => update_class_room(UpdateClassRoomRequest),
    toggle: deactivate_class_room, activate_class_room => set_class_room_active,
}
