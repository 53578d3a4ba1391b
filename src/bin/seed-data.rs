//! Demo data seeder.
//!
//! Loads a JSON fixture (`--fixture data.json`) or generates synthetic
//! workstreams, schools and people, then prints the created logins.
//!
//! Usage:
//!   DATABASE_URL=... seed-data --workstreams 2 --schools-per-workstream 3 --students-per-school 40
//!   DATABASE_URL=... seed-data --fixture fixtures/demo.json --reset

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{Datelike, Duration, NaiveDate, Utc};
use clap::Parser;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use serde::Deserialize;
use sqlx::{postgres::PgPoolOptions, PgConnection};
use uuid::Uuid;

use edutrack_api::{middleware::workstream::slugify, models::user::normalize_email};

const TABLES: &str = "activity_logs, user_login_history, staff_evaluations, support_tickets, message_receipts, \
                      messages, notifications, learning_materials, lesson_plans, attendance, marks, assignments, \
                      course_allocations, student_enrollments, class_rooms, courses, secretaries, \
                      guardian_student_links, guardians, students, teachers, grades, academic_years, \
                      system_configurations, password_reset_tokens, refresh_tokens, users, schools, work_streams";

const FIRST_NAMES: [&str; 16] = [
    "Amina", "Bilal", "Chloe", "Daniel", "Elif", "Farid", "Grace", "Hugo", "Ines", "Jonas", "Kenji", "Lina", "Mateo",
    "Nora", "Omar", "Priya",
];
const LAST_NAMES: [&str; 12] = [
    "Haddad", "Keller", "Moreau", "Okafor", "Petrov", "Rossi", "Sato", "Tanaka", "Usman", "Varga", "Weber", "Yilmaz",
];
const SUBJECTS: [(&str, &str); 6] = [
    ("MATH", "Mathematics"),
    ("SCI", "Science"),
    ("ENG", "English"),
    ("HIST", "History"),
    ("GEO", "Geography"),
    ("ART", "Art"),
];
const REGIONS: [&str; 6] = ["North", "South", "East", "West", "Central", "Coastal"];

#[derive(Parser)]
#[command(name = "seed-data", about = "Seed the EduTrack database with demo data")]
struct Args {
    /// JSON fixture to load instead of generating data
    #[arg(long)]
    fixture: Option<PathBuf>,

    #[arg(long, default_value_t = 1)]
    workstreams: usize,

    #[arg(long, default_value_t = 2)]
    schools_per_workstream: usize,

    #[arg(long, default_value_t = 20)]
    students_per_school: usize,

    /// Password given to every account that does not set one
    #[arg(long, default_value = "EduTrack2024!")]
    password: String,

    /// Fixed RNG seed for reproducible synthetic data
    #[arg(long)]
    seed: Option<u64>,

    /// Truncate every table before seeding
    #[arg(long)]
    reset: bool,
}

#[derive(Debug, Deserialize)]
struct Fixture {
    workstreams: Vec<WorkStreamFixture>,
}

#[derive(Debug, Deserialize)]
struct WorkStreamFixture {
    name: String,
    slug: Option<String>,
    #[serde(default = "default_capacity")]
    capacity: i32,
    location: Option<String>,
    manager: Option<Person>,
    #[serde(default)]
    schools: Vec<SchoolFixture>,
}

fn default_capacity() -> i32 {
    10
}

#[derive(Debug, Deserialize)]
struct SchoolFixture {
    school_name: String,
    location: Option<String>,
    capacity: Option<i32>,
    manager: Option<Person>,
    #[serde(default)]
    grades: Vec<GradeFixture>,
    #[serde(default)]
    academic_years: Vec<YearFixture>,
    #[serde(default)]
    classrooms: Vec<ClassRoomFixture>,
    #[serde(default)]
    courses: Vec<CourseFixture>,
    #[serde(default)]
    teachers: Vec<TeacherFixture>,
    #[serde(default)]
    secretaries: Vec<Person>,
    #[serde(default)]
    students: Vec<StudentFixture>,
    #[serde(default)]
    guardians: Vec<GuardianFixture>,
}

#[derive(Debug, Deserialize)]
struct GradeFixture {
    name: String,
    numeric_level: i32,
    min_age: i32,
    max_age: i32,
}

#[derive(Debug, Deserialize)]
struct YearFixture {
    code: String,
    start_date: NaiveDate,
    end_date: NaiveDate,
    #[serde(default)]
    is_current: bool,
}

#[derive(Debug, Deserialize)]
struct ClassRoomFixture {
    name: String,
    /// Grade name.
    grade: String,
    /// Academic year code.
    academic_year: String,
    capacity: Option<i32>,
    /// Homeroom teacher email.
    homeroom: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CourseFixture {
    code: String,
    name: String,
    grade: String,
    description: Option<String>,
    /// Teacher email; allocates the course to every classroom of its grade.
    teacher: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Person {
    email: String,
    full_name: String,
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TeacherFixture {
    #[serde(flatten)]
    person: Person,
    specialization: Option<String>,
    hire_date: Option<NaiveDate>,
    #[serde(default = "full_time")]
    employment_status: String,
}

fn full_time() -> String {
    "full_time".into()
}

#[derive(Debug, Deserialize)]
struct StudentFixture {
    #[serde(flatten)]
    person: Person,
    date_of_birth: NaiveDate,
    grade: Option<String>,
    /// Classroom name in the current academic year.
    classroom: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GuardianFixture {
    #[serde(flatten)]
    person: Person,
    occupation: Option<String>,
    /// Student emails.
    #[serde(default)]
    students: Vec<String>,
    #[serde(default = "parent")]
    relationship_type: String,
}

fn parent() -> String {
    "parent".into()
}

/// A login printed once seeding finishes.
struct Credential {
    role: &'static str,
    email: String,
    password: String,
}

/// Caches bcrypt hashes so a shared password is only hashed once.
struct Accounts {
    default_password: String,
    hashes: HashMap<String, String>,
    created: Vec<Credential>,
}

impl Accounts {
    fn new(default_password: String) -> Self {
        Self { default_password, hashes: HashMap::new(), created: Vec::new() }
    }

    async fn create(
        &mut self,
        conn: &mut PgConnection,
        person: &Person,
        role: &'static str,
        work_stream_id: Option<Uuid>,
        school_id: Option<Uuid>,
    ) -> Result<Uuid> {
        let password = person.password.clone().unwrap_or_else(|| self.default_password.clone());
        let hash = match self.hashes.get(&password) {
            Some(h) => h.clone(),
            None => {
                let h = bcrypt::hash(&password, 10).context("Failed to hash password")?;
                self.hashes.insert(password.clone(), h.clone());
                h
            }
        };

        let email = normalize_email(&person.email);
        let id: Uuid = sqlx::query_scalar(
            "INSERT INTO users (email, full_name, password_hash, role, work_stream_id, school_id)
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
        )
        .bind(&email)
        .bind(&person.full_name)
        .bind(&hash)
        .bind(role)
        .bind(work_stream_id)
        .bind(school_id)
        .fetch_one(&mut *conn)
        .await
        .with_context(|| format!("Failed to insert user {email}"))?;

        self.created.push(Credential { role, email, password });
        Ok(id)
    }
}

fn person(rng: &mut StdRng, domain: &str, tag: &str, n: usize) -> Person {
    let first = FIRST_NAMES.choose(rng).copied().unwrap_or("Alex");
    let last = LAST_NAMES.choose(rng).copied().unwrap_or("Doe");
    Person {
        email: format!("{}.{}.{tag}{n}@{domain}", first.to_lowercase(), last.to_lowercase()),
        full_name: format!("{first} {last}"),
        password: None,
    }
}

/// School year starting in September of the current (or previous) year.
fn current_year(today: NaiveDate) -> YearFixture {
    let start_year = if today.month() >= 9 { today.year() } else { today.year() - 1 };
    let start = NaiveDate::from_ymd_opt(start_year, 9, 1).unwrap_or(today);
    let end = NaiveDate::from_ymd_opt(start_year + 1, 6, 30).unwrap_or(today + Duration::days(300));
    YearFixture { code: format!("{}-{}", start_year, start_year + 1), start_date: start, end_date: end, is_current: true }
}

fn synthetic(args: &Args, rng: &mut StdRng) -> Fixture {
    let today = Utc::now().date_naive();
    let mut workstreams = Vec::with_capacity(args.workstreams);

    for w in 0..args.workstreams {
        let region = REGIONS[w % REGIONS.len()];
        let name = if w < REGIONS.len() { format!("{region} District") } else { format!("{region} District {w}") };
        let domain = format!("{}.edutrack.test", slugify(&name));

        let mut schools = Vec::with_capacity(args.schools_per_workstream);
        for s in 0..args.schools_per_workstream {
            let tag = format!("w{w}s{s}");
            let grades: Vec<GradeFixture> = (1..=3)
                .map(|level| GradeFixture {
                    name: format!("Grade {level}"),
                    numeric_level: level,
                    min_age: 5 + level,
                    max_age: 7 + level,
                })
                .collect();
            let year = current_year(today);

            let teachers: Vec<TeacherFixture> = (0..grades.len() + 1)
                .map(|t| TeacherFixture {
                    person: person(rng, &domain, &format!("t{tag}"), t),
                    specialization: SUBJECTS.choose(rng).map(|(_, name)| name.to_string()),
                    hire_date: Some(today - Duration::days(rng.gen_range(200..3000))),
                    employment_status: full_time(),
                })
                .collect();

            let classrooms: Vec<ClassRoomFixture> = grades
                .iter()
                .enumerate()
                .map(|(i, g)| ClassRoomFixture {
                    name: format!("{}A", g.numeric_level),
                    grade: g.name.clone(),
                    academic_year: year.code.clone(),
                    capacity: Some(30),
                    homeroom: Some(teachers[i].person.email.clone()),
                })
                .collect();

            let mut courses = Vec::new();
            for (i, g) in grades.iter().enumerate() {
                for (code, subject) in SUBJECTS.iter().take(3) {
                    courses.push(CourseFixture {
                        code: format!("{code}{}", g.numeric_level),
                        name: format!("{subject} {}", g.numeric_level),
                        grade: g.name.clone(),
                        description: None,
                        teacher: Some(teachers[i].person.email.clone()),
                    });
                }
            }

            let students: Vec<StudentFixture> = (0..args.students_per_school)
                .map(|n| {
                    let g = &grades[n % grades.len()];
                    let age = rng.gen_range(g.min_age..=g.max_age);
                    StudentFixture {
                        person: person(rng, &domain, &format!("s{tag}"), n),
                        date_of_birth: today - Duration::days(i64::from(age) * 365 + rng.gen_range(0..365)),
                        grade: Some(g.name.clone()),
                        classroom: Some(format!("{}A", g.numeric_level)),
                    }
                })
                .collect();

            let guardians: Vec<GuardianFixture> = students
                .chunks(2)
                .enumerate()
                .map(|(n, kids)| GuardianFixture {
                    person: person(rng, &domain, &format!("g{tag}"), n),
                    occupation: None,
                    students: kids.iter().map(|k| k.person.email.clone()).collect(),
                    relationship_type: parent(),
                })
                .collect();

            schools.push(SchoolFixture {
                school_name: format!("{region} School {}", s + 1),
                location: Some(format!("{region} Avenue {}", rng.gen_range(1..200))),
                capacity: Some(500),
                manager: Some(person(rng, &domain, &format!("m{tag}"), 0)),
                grades,
                academic_years: vec![year],
                classrooms,
                courses,
                teachers,
                secretaries: vec![person(rng, &domain, &format!("sec{tag}"), 0)],
                students,
                guardians,
            });
        }

        workstreams.push(WorkStreamFixture {
            name,
            slug: None,
            capacity: (args.schools_per_workstream as i32).max(1) + 2,
            location: Some(region.to_string()),
            manager: Some(person(rng, &domain, &format!("mw{w}"), 0)),
            schools,
        });
    }

    Fixture { workstreams }
}

async fn load_school(
    conn: &mut PgConnection,
    accounts: &mut Accounts,
    work_stream_id: Uuid,
    school: &SchoolFixture,
) -> Result<()> {
    let school_id: Uuid = sqlx::query_scalar(
        "INSERT INTO schools (work_stream_id, school_name, location, capacity) VALUES ($1, $2, $3, $4) RETURNING id",
    )
    .bind(work_stream_id)
    .bind(&school.school_name)
    .bind(&school.location)
    .bind(school.capacity)
    .fetch_one(&mut *conn)
    .await
    .with_context(|| format!("Failed to insert school {}", school.school_name))?;
    println!("  School {}", school.school_name);

    if let Some(manager) = &school.manager {
        let id = accounts.create(conn, manager, "manager_school", Some(work_stream_id), Some(school_id)).await?;
        sqlx::query("UPDATE schools SET manager_id = $1 WHERE id = $2")
            .bind(id)
            .bind(school_id)
            .execute(&mut *conn)
            .await?;
    }

    let mut grades = HashMap::new();
    for g in &school.grades {
        let id: Uuid = sqlx::query_scalar(
            "INSERT INTO grades (school_id, name, numeric_level, min_age, max_age)
             VALUES ($1, $2, $3, $4, $5) RETURNING id",
        )
        .bind(school_id)
        .bind(&g.name)
        .bind(g.numeric_level)
        .bind(g.min_age)
        .bind(g.max_age)
        .fetch_one(&mut *conn)
        .await?;
        grades.insert(g.name.as_str(), id);
    }

    let mut years = HashMap::new();
    let mut current_year = None;
    for y in &school.academic_years {
        let id: Uuid = sqlx::query_scalar(
            "INSERT INTO academic_years (school_id, academic_year_code, start_date, end_date, is_current)
             VALUES ($1, $2, $3, $4, $5) RETURNING id",
        )
        .bind(school_id)
        .bind(&y.code)
        .bind(y.start_date)
        .bind(y.end_date)
        .bind(y.is_current)
        .fetch_one(&mut *conn)
        .await?;
        years.insert(y.code.as_str(), id);
        if y.is_current {
            current_year = Some(id);
        }
    }

    let mut teachers = HashMap::new();
    for t in &school.teachers {
        let id = accounts.create(conn, &t.person, "teacher", Some(work_stream_id), Some(school_id)).await?;
        sqlx::query(
            "INSERT INTO teachers (user_id, specialization, hire_date, employment_status) VALUES ($1, $2, $3, $4)",
        )
        .bind(id)
        .bind(&t.specialization)
        .bind(t.hire_date.unwrap_or_else(|| Utc::now().date_naive()))
        .bind(&t.employment_status)
        .execute(&mut *conn)
        .await?;
        teachers.insert(normalize_email(&t.person.email), id);
    }

    for s in &school.secretaries {
        let id = accounts.create(conn, s, "secretary", Some(work_stream_id), Some(school_id)).await?;
        sqlx::query("INSERT INTO secretaries (user_id, department, hire_date) VALUES ($1, 'Administration', CURRENT_DATE)")
            .bind(id)
            .execute(&mut *conn)
            .await?;
    }

    // (grade, year) -> classrooms, and (name in current year) -> classroom
    let mut rooms_by_grade: HashMap<(Uuid, Uuid), Vec<Uuid>> = HashMap::new();
    let mut current_rooms = HashMap::new();
    for c in &school.classrooms {
        let Some(&grade_id) = grades.get(c.grade.as_str()) else {
            bail!("Classroom {} references unknown grade {}", c.name, c.grade);
        };
        let Some(&year_id) = years.get(c.academic_year.as_str()) else {
            bail!("Classroom {} references unknown academic year {}", c.name, c.academic_year);
        };
        let homeroom = c.homeroom.as_deref().and_then(|e| teachers.get(&normalize_email(e)).copied());
        let id: Uuid = sqlx::query_scalar(
            "INSERT INTO class_rooms (school_id, academic_year_id, grade_id, classroom_name, capacity, homeroom_teacher_id)
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
        )
        .bind(school_id)
        .bind(year_id)
        .bind(grade_id)
        .bind(&c.name)
        .bind(c.capacity)
        .bind(homeroom)
        .fetch_one(&mut *conn)
        .await?;
        rooms_by_grade.entry((grade_id, year_id)).or_default().push(id);
        if Some(year_id) == current_year {
            current_rooms.insert(c.name.as_str(), (id, year_id));
        }
    }

    for c in &school.courses {
        let Some(&grade_id) = grades.get(c.grade.as_str()) else {
            bail!("Course {} references unknown grade {}", c.code, c.grade);
        };
        let course_id: Uuid = sqlx::query_scalar(
            "INSERT INTO courses (school_id, grade_id, course_code, name, description)
             VALUES ($1, $2, $3, $4, $5) RETURNING id",
        )
        .bind(school_id)
        .bind(grade_id)
        .bind(&c.code)
        .bind(&c.name)
        .bind(&c.description)
        .fetch_one(&mut *conn)
        .await?;

        let (Some(teacher_email), Some(year_id)) = (&c.teacher, current_year) else {
            continue;
        };
        let Some(&teacher_id) = teachers.get(&normalize_email(teacher_email)) else {
            bail!("Course {} references unknown teacher {teacher_email}", c.code);
        };
        for room in rooms_by_grade.get(&(grade_id, year_id)).into_iter().flatten() {
            sqlx::query(
                "INSERT INTO course_allocations (course_id, class_room_id, teacher_id, academic_year_id)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(course_id)
            .bind(room)
            .bind(teacher_id)
            .bind(year_id)
            .execute(&mut *conn)
            .await?;
        }
    }

    let mut students = HashMap::new();
    for s in &school.students {
        let id = accounts.create(conn, &s.person, "student", Some(work_stream_id), Some(school_id)).await?;
        let grade_id = s.grade.as_deref().and_then(|g| grades.get(g).copied());
        sqlx::query(
            "INSERT INTO students (user_id, school_id, grade_id, date_of_birth, admission_date)
             VALUES ($1, $2, $3, $4, CURRENT_DATE)",
        )
        .bind(id)
        .bind(school_id)
        .bind(grade_id)
        .bind(s.date_of_birth)
        .execute(&mut *conn)
        .await?;

        if let Some(&(room, year)) = s.classroom.as_deref().and_then(|c| current_rooms.get(c)) {
            sqlx::query(
                "INSERT INTO student_enrollments (student_id, class_room_id, academic_year_id) VALUES ($1, $2, $3)",
            )
            .bind(id)
            .bind(room)
            .bind(year)
            .execute(&mut *conn)
            .await?;
        }
        students.insert(normalize_email(&s.person.email), id);
    }

    for g in &school.guardians {
        let id = accounts.create(conn, &g.person, "guardian", Some(work_stream_id), Some(school_id)).await?;
        sqlx::query("INSERT INTO guardians (user_id, occupation) VALUES ($1, $2)")
            .bind(id)
            .bind(&g.occupation)
            .execute(&mut *conn)
            .await?;
        for email in &g.students {
            let Some(&student_id) = students.get(&normalize_email(email)) else {
                bail!("Guardian {} references unknown student {email}", g.person.email);
            };
            sqlx::query(
                "INSERT INTO guardian_student_links (guardian_id, student_id, relationship_type) VALUES ($1, $2, $3)",
            )
            .bind(id)
            .bind(student_id)
            .bind(&g.relationship_type)
            .execute(&mut *conn)
            .await?;
        }
    }

    Ok(())
}

async fn load(conn: &mut PgConnection, accounts: &mut Accounts, fixture: &Fixture) -> Result<()> {
    for ws in &fixture.workstreams {
        let slug = ws.slug.clone().unwrap_or_else(|| slugify(&ws.name));
        let work_stream_id: Uuid = sqlx::query_scalar(
            "INSERT INTO work_streams (name, slug, capacity, location) VALUES ($1, $2, $3, $4) RETURNING id",
        )
        .bind(&ws.name)
        .bind(&slug)
        .bind(ws.capacity)
        .bind(&ws.location)
        .fetch_one(&mut *conn)
        .await
        .with_context(|| format!("Failed to insert workstream {}", ws.name))?;
        println!("Workstream {} ({slug})", ws.name);

        if let Some(manager) = &ws.manager {
            let id = accounts.create(conn, manager, "manager_workstream", Some(work_stream_id), None).await?;
            sqlx::query("UPDATE work_streams SET manager_id = $1 WHERE id = $2")
                .bind(id)
                .bind(work_stream_id)
                .execute(&mut *conn)
                .await?;
        }

        for school in &ws.schools {
            load_school(conn, accounts, work_stream_id, school).await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL required")?;
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&database_url)
        .await
        .context("Failed to connect to database")?;

    let fixture = match &args.fixture {
        Some(path) => {
            let raw = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("Invalid fixture {}", path.display()))?
        }
        None => {
            let mut rng = match args.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            synthetic(&args, &mut rng)
        }
    };

    let mut tx = pool.begin().await?;
    if args.reset {
        println!("Truncating all tables...");
        sqlx::raw_sql(&format!("TRUNCATE {TABLES} RESTART IDENTITY CASCADE"))
            .execute(&mut *tx)
            .await
            .context("Failed to truncate tables")?;
    }

    let mut accounts = Accounts::new(args.password.clone());
    load(&mut tx, &mut accounts, &fixture).await?;
    tx.commit().await?;

    println!("\n=== {} accounts created ===", accounts.created.len());
    for c in &accounts.created {
        println!("{:<20} {:<50} {}", c.role, c.email, c.password);
    }
    Ok(())
}
