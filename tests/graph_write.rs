mod common;

use bson::oid::ObjectId;
use bson::{doc, Bson};

use eduweb_backend::data::{op_ref, IdRef};
use eduweb_backend::error::{EngineError, ProblemReason};
use eduweb_backend::orchestrator::GraphOp;
use eduweb_backend::schema::{EntityKind, Layout};

use common::{assert_references_resolve, classroom, engine, forum, user};

#[tokio::test]
async fn failed_batch_leaves_nothing_behind() {
    let engine = engine(Layout::Normalized);

    let err = engine
        .create_entity_graph(vec![
            user("teacher_chem", "teacher"),
            GraphOp::insert(EntityKind::Subject, doc! { "name": "Chemistry" }),
            GraphOp::insert(
                EntityKind::Classroom,
                doc! { "name": "Chemistry 101", "teacher_id": op_ref(0), "subject_id": ObjectId::new() },
            ),
        ])
        .await
        .unwrap_err();
    assert!(matches!(
        err.problems()[0].reason,
        ProblemReason::Unresolved {
            target: EntityKind::Subject,
            ..
        }
    ));
    assert!(!err.is_retryable());

    for collection in ["user", "subject", "classroom"] {
        assert_eq!(engine.store().count(collection).await, 0, "{}", collection);
    }
}

#[tokio::test]
async fn wrong_kind_op_reference_is_rejected_before_writing() {
    let engine = engine(Layout::Normalized);

    let err = engine
        .create_entity_graph(vec![
            GraphOp::insert(EntityKind::Subject, doc! { "name": "Chemistry" }),
            user("teacher_chem", "teacher"),
            GraphOp::insert(
                EntityKind::Classroom,
                doc! { "name": "Chemistry 101", "teacher_id": op_ref(0), "subject_id": op_ref(0) },
            ),
        ])
        .await
        .unwrap_err();
    let problems: Vec<_> = err
        .problems()
        .iter()
        .map(|p| (p.op, p.field.as_str(), p.reason.clone()))
        .collect();
    assert_eq!(
        problems,
        vec![(Some(2), "teacher_id", ProblemReason::UnknownOpRef { index: 0 })]
    );
    for collection in ["user", "subject", "classroom"] {
        assert_eq!(engine.store().count(collection).await, 0, "{}", collection);
    }
}

#[tokio::test]
async fn missing_update_target_rolls_back_earlier_ops() {
    let engine = engine(Layout::Normalized);
    let missing = ObjectId::new();

    let err = engine
        .run_graph_write(vec![
            GraphOp::insert(EntityKind::Subject, doc! { "name": "Biology" }),
            GraphOp::update(EntityKind::Subject, missing, doc! { "name": "Botany" }),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { entity: EntityKind::Subject, .. }));
    assert_eq!(engine.store().count("subject").await, 0);
}

#[tokio::test]
async fn mixed_batch_reports_counts() {
    let engine = engine(Layout::Normalized);
    let fixture = classroom(&engine).await;

    let result = engine
        .run_graph_write(vec![
            GraphOp::insert(
                EntityKind::Submission,
                doc! { "title": "Lab report", "description": "Measure g", "classroom_id": fixture.classroom },
            ),
            GraphOp::update(EntityKind::Submission, IdRef::Op(0), doc! { "title": "Lab report 1" }),
            GraphOp::delete(EntityKind::SectionFile, fixture.files[0]),
        ])
        .await
        .unwrap();
    assert_eq!(result.inserted.len(), 1);
    assert_eq!(result.modified, 1);
    assert_eq!(result.deleted, 1);

    let submissions = engine.store().documents("submission").await;
    assert_eq!(submissions[0].get_str("title").unwrap(), "Lab report 1");
    assert_eq!(submissions[0].get_object_id("_id").unwrap(), result.inserted[0]);
    assert_eq!(engine.store().count("sectionFile").await, 1);
    assert_references_resolve(&engine).await;
}

#[tokio::test]
async fn restricted_delete_is_rejected() {
    let engine = engine(Layout::Normalized);
    let fixture = classroom(&engine).await;

    let err = engine
        .run_graph_write(vec![GraphOp::delete(EntityKind::Section, fixture.sections[0])])
        .await
        .unwrap_err();
    assert_eq!(
        err.problems()[0].reason,
        ProblemReason::StillReferenced {
            by: EntityKind::SectionFile,
            count: 1
        }
    );
    assert_eq!(engine.store().count("section").await, 2);

    // Re-pointing the file first makes the delete valid.
    engine
        .run_graph_write(vec![
            GraphOp::update(EntityKind::SectionFile, fixture.files[0], doc! { "section_id": fixture.sections[1] }),
            GraphOp::delete(EntityKind::Section, fixture.sections[0]),
        ])
        .await
        .unwrap();
    assert_eq!(engine.store().count("section").await, 1);
    assert_references_resolve(&engine).await;
}

#[tokio::test]
async fn ids_are_engine_assigned_and_immutable() {
    let engine = engine(Layout::Normalized);
    let subject = engine
        .create_entity_graph(vec![GraphOp::insert(EntityKind::Subject, doc! { "name": "Art" })])
        .await
        .unwrap()[0];

    let err = engine
        .run_graph_write(vec![
            GraphOp::insert(EntityKind::Subject, doc! { "_id": ObjectId::new(), "name": "Music" }),
            GraphOp::update(EntityKind::Subject, subject, doc! { "_id": ObjectId::new() }),
        ])
        .await
        .unwrap_err();
    let reasons: Vec<_> = err.problems().iter().map(|p| (p.op, p.reason.clone())).collect();
    assert_eq!(
        reasons,
        vec![
            (Some(0), ProblemReason::EngineAssignedId),
            (Some(1), ProblemReason::EngineAssignedId),
            (Some(1), ProblemReason::Missing),
        ]
    );
    assert_eq!(engine.store().count("subject").await, 1);
}

#[tokio::test]
async fn duplicate_email_race_has_one_winner() {
    let engine = engine(Layout::Normalized);
    engine.apply_index_plan().await.unwrap();

    let (a, b) = tokio::join!(
        engine.create_entity_graph(vec![user("twin", "student")]),
        engine.create_entity_graph(vec![user("twin", "teacher")]),
    );
    let results = [a, b];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);

    let err = results.into_iter().find_map(Result::err).unwrap();
    assert!(
        matches!(err, EngineError::Validation(_) | EngineError::Conflict { .. }),
        "{}",
        err
    );
    assert_eq!(engine.store().count("user").await, 1);
}

#[tokio::test]
async fn concurrent_parent_delete_conflicts() {
    let engine = engine(Layout::Normalized);
    let posts = forum(&engine).await;
    let author = engine.store().documents("user").await[0]
        .get_object_id("_id")
        .unwrap();

    let (comment, cascade) = tokio::join!(
        engine.create_entity_graph(vec![GraphOp::insert(
            EntityKind::ForumComment,
            doc! { "content": "late reply", "forumPost_id": posts[2], "user_id": author },
        )]),
        engine.cascade_delete(EntityKind::ForumPost, posts[2]),
    );
    // Either may lose the race, but never both and never silently.
    assert!(comment.is_ok() || cascade.is_ok());
    for err in [comment.err(), cascade.err()].into_iter().flatten() {
        assert!(
            matches!(err, EngineError::Conflict { .. } | EngineError::Validation(_)),
            "{}",
            err
        );
    }
    assert_references_resolve(&engine).await;
}

#[tokio::test]
async fn denormalized_writes_go_through_the_classroom() {
    let engine = engine(Layout::Denormalized);
    let ids = engine
        .create_entity_graph(vec![
            user("teacher_bio", "teacher"),
            GraphOp::insert(
                EntityKind::Classroom,
                doc! {
                    "name": "Biology 101",
                    "teacher": { "username": "teacher_bio" },
                    "subject": { "name": "Biology" },
                    "forum_posts": [
                        { "title": "Cells", "content": "...", "user_id": op_ref(0), "comments": [] },
                    ],
                },
            ),
        ])
        .await
        .unwrap();

    let classrooms = engine.store().documents("classroom").await;
    let stored = &classrooms[0];
    assert_eq!(stored.get_object_id("_id").unwrap(), ids[1]);
    let post = stored.get_array("forum_posts").unwrap()[0].as_document().unwrap();
    assert!(post.get_object_id("_id").is_ok());
    assert_eq!(post.get("user_id"), Some(&Bson::ObjectId(ids[0])));

    let err = engine
        .run_graph_write(vec![GraphOp::insert(
            EntityKind::ForumComment,
            doc! { "content": "hi", "user_id": ids[0] },
        )])
        .await
        .unwrap_err();
    assert_eq!(
        err.problems()[0].reason,
        ProblemReason::EmbeddedWrite {
            root: EntityKind::Classroom
        }
    );
    assert_references_resolve(&engine).await;
}
