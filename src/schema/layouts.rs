use super::{Cardinality, EntityKind, FieldKind, Layout, RegistryError, SchemaRegistry};

use EntityKind::*;

pub(super) fn normalized() -> Result<SchemaRegistry, RegistryError> {
    let mut b = SchemaRegistry::builder(Layout::Normalized);

    b.collection(User)
        .text("username")
        .field("email", FieldKind::Email, true)
        .text("password")
        .field("role", FieldKind::Role, true)
        .field("disabled", FieldKind::Bool, false)
        .done();
    b.collection(Subject)
        .text("name")
        .field("description", FieldKind::Text, false)
        .done();
    b.collection(Classroom)
        .text("name")
        .reference("teacher_id", User, false)
        .reference("subject_id", Subject, false)
        .done();
    b.collection(Section)
        .text("title")
        .text("description")
        .reference("classroom_id", Classroom, true)
        .done();
    b.collection(SectionFile)
        .text("file_name")
        .text("file_url")
        .reference("section_id", Section, true)
        .done();
    b.collection(Submission)
        .text("title")
        .text("description")
        .reference("classroom_id", Classroom, true)
        .done();
    b.collection(SubmissionFile)
        .text("file_name")
        .text("file_url")
        .reference("submission_id", Submission, true)
        .done();
    b.collection(Participant)
        .reference("classroom_id", Classroom, true)
        .reference("user_id", User, false)
        .field("role", FieldKind::Role, false)
        .done();
    b.collection(TestQuestion)
        .text("title")
        .reference("submission_id", Submission, true)
        .done();
    b.collection(Question)
        .text("content")
        .reference("testQuestion_id", TestQuestion, true)
        .done();
    b.collection(Answer)
        .text("content")
        .field("is_correct", FieldKind::Bool, true)
        .reference("question_id", Question, true)
        .done();
    // A user's forum activity goes with the user.
    b.collection(ForumPost)
        .reference("user_id", User, true)
        .text("title")
        .text("content")
        .field("type", FieldKind::Text, false)
        .done();
    b.collection(ForumComment)
        .text("content")
        .reference("forumPost_id", ForumPost, true)
        .reference("user_id", User, true)
        .done();

    b.build()
}

/// Classroom documents carry their whole tree. Users stay in their own
/// collection; the classroom keeps snapshots of its teacher and subject.
pub(super) fn denormalized() -> Result<SchemaRegistry, RegistryError> {
    use Cardinality::{Many, One};

    let mut b = SchemaRegistry::builder(Layout::Denormalized);

    b.collection(User)
        .text("username")
        .field("email", FieldKind::Email, true)
        .text("password")
        .field("role", FieldKind::Role, true)
        .field("disabled", FieldKind::Bool, false)
        .done();
    b.collection(Classroom)
        .text("name")
        .snapshot("teacher", User, One)
        .done();
    b.embedded(Subject, Classroom, "subject", One)
        .text("name")
        .field("description", FieldKind::Text, false)
        .done();
    b.embedded(Participant, Classroom, "students", Many)
        .text("username")
        .field("email", FieldKind::Email, false)
        .field("role", FieldKind::Role, false)
        .done();
    b.embedded(Section, Classroom, "sections", Many)
        .text("title")
        .text("description")
        .done();
    b.embedded(SectionFile, Section, "files", Many)
        .text("file_name")
        .text("file_url")
        .done();
    b.embedded(Submission, Classroom, "submissions", Many)
        .text("title")
        .text("description")
        .done();
    b.embedded(SubmissionFile, Submission, "files", Many)
        .text("file_name")
        .text("file_url")
        .done();
    b.embedded(TestQuestion, Classroom, "test_questions", Many)
        .text("title")
        .done();
    b.embedded(Question, TestQuestion, "questions", Many)
        .text("content")
        .done();
    b.embedded(Answer, Question, "answers", Many)
        .text("content")
        .field("is_correct", FieldKind::Bool, true)
        .done();
    b.embedded(ForumPost, Classroom, "forum_posts", Many)
        .reference("user_id", User, false)
        .text("title")
        .text("content")
        .done();
    b.embedded(ForumComment, ForumPost, "comments", Many)
        .reference("user_id", User, false)
        .text("content")
        .done();

    b.build()
}
