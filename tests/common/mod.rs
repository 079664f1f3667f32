#![allow(dead_code)]

use std::sync::Arc;

use bson::oid::ObjectId;
use bson::{doc, Bson, Document};

use eduweb_backend::data::{ids_at, op_ref};
use eduweb_backend::engine::Engine;
use eduweb_backend::orchestrator::GraphOp;
use eduweb_backend::schema::{EntityKind, Layout, SchemaRegistry};
use eduweb_backend::store::MemoryStore;

pub fn engine(layout: Layout) -> Engine<MemoryStore> {
    let registry = SchemaRegistry::for_layout(layout).unwrap();
    Engine::new(MemoryStore::new(), Arc::new(registry))
}

pub fn user(username: &str, role: &str) -> GraphOp {
    GraphOp::insert(
        EntityKind::User,
        doc! {
            "username": username,
            "email": format!("{}@example.com", username),
            "password": "$2b$12$hashed",
            "role": role,
        },
    )
}

/// Ids of the normalized classroom fixture.
pub struct Classroom {
    pub teacher: ObjectId,
    pub subject: ObjectId,
    pub classroom: ObjectId,
    pub sections: [ObjectId; 2],
    pub files: [ObjectId; 2],
    pub students: [ObjectId; 2],
    pub participants: [ObjectId; 2],
}

/// A teacher, a subject and a classroom with two sections holding one
/// file each, and two students taking part in it.
pub async fn classroom(engine: &Engine<MemoryStore>) -> Classroom {
    let ids = engine
        .create_entity_graph(vec![
            user("teacher_physics", "teacher"),
            GraphOp::insert(EntityKind::Subject, doc! { "name": "Physics", "description": "Mechanics" }),
            GraphOp::insert(
                EntityKind::Classroom,
                doc! { "name": "Physics 101", "teacher_id": op_ref(0), "subject_id": op_ref(1) },
            ),
            GraphOp::insert(
                EntityKind::Section,
                doc! { "title": "Kinematics", "description": "Motion in one dimension", "classroom_id": op_ref(2) },
            ),
            GraphOp::insert(
                EntityKind::Section,
                doc! { "title": "Dynamics", "description": "Newton's laws", "classroom_id": op_ref(2) },
            ),
            GraphOp::insert(
                EntityKind::SectionFile,
                doc! { "file_name": "kinematics.pdf", "file_url": "/files/kinematics.pdf", "section_id": op_ref(3) },
            ),
            GraphOp::insert(
                EntityKind::SectionFile,
                doc! { "file_name": "dynamics.pdf", "file_url": "/files/dynamics.pdf", "section_id": op_ref(4) },
            ),
            user("student_b", "student"),
            user("student_c", "student"),
            GraphOp::insert(
                EntityKind::Participant,
                doc! { "classroom_id": op_ref(2), "user_id": op_ref(7), "role": "student" },
            ),
            GraphOp::insert(
                EntityKind::Participant,
                doc! { "classroom_id": op_ref(2), "user_id": op_ref(8), "role": "student" },
            ),
        ])
        .await
        .unwrap();

    Classroom {
        teacher: ids[0],
        subject: ids[1],
        classroom: ids[2],
        sections: [ids[3], ids[4]],
        files: [ids[5], ids[6]],
        students: [ids[7], ids[8]],
        participants: [ids[9], ids[10]],
    }
}

/// Three posts by one new user; the first gets three comments, the
/// second one and the third none. Returns the post ids.
pub async fn forum(engine: &Engine<MemoryStore>) -> [ObjectId; 3] {
    let author = engine
        .create_entity_graph(vec![user("student_a", "student")])
        .await
        .unwrap()[0];
    forum_by(engine, [author; 3]).await
}

/// Like [`forum`], with post `i` written by `authors[i]`. Comments are
/// written by the author of the post they answer.
pub async fn forum_by(engine: &Engine<MemoryStore>, authors: [ObjectId; 3]) -> [ObjectId; 3] {
    let mut ops = Vec::new();
    for (title, author) in ["Newton's first law", "Friction", "Unanswered"].into_iter().zip(authors) {
        ops.push(GraphOp::insert(
            EntityKind::ForumPost,
            doc! { "user_id": author, "title": title, "content": "...", "type": "discuss" },
        ));
    }
    for post in [0, 0, 0, 1] {
        ops.push(GraphOp::insert(
            EntityKind::ForumComment,
            doc! { "content": "reply", "forumPost_id": op_ref(post), "user_id": authors[post] },
        ));
    }

    let ids = engine.create_entity_graph(ops).await.unwrap();
    [ids[0], ids[1], ids[2]]
}

/// Reads an integral or floating point metric.
pub fn number(row: &Document, field: &str) -> f64 {
    match row.get(field) {
        Some(Bson::Int32(n)) => *n as f64,
        Some(Bson::Int64(n)) => *n as f64,
        Some(Bson::Double(n)) => *n,
        other => panic!("{} is not numeric: {:?}", field, other),
    }
}

/// Scans every collection and checks that each stored reference points
/// at an existing record.
pub async fn assert_references_resolve(engine: &Engine<MemoryStore>) {
    let registry = engine.registry();
    for def in registry.entities() {
        let location = registry.location(def.kind).unwrap();
        for edge in &def.edges {
            let target = registry.location(edge.target).unwrap();
            let mut existing = Vec::new();
            for doc in engine.store().documents(target.collection).await {
                existing.extend(ids_at(&doc, &target.path("_id")));
            }
            for doc in engine.store().documents(location.collection).await {
                for id in ids_at(&doc, &location.path(edge.foreign_key)) {
                    assert!(
                        existing.contains(&id),
                        "{}.{} points at missing {} {}",
                        def.kind,
                        edge.foreign_key,
                        edge.target,
                        id
                    );
                }
            }
        }
    }
}
