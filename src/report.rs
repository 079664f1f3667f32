use std::fmt::{Display, Formatter};
use std::str::FromStr;

use bson::oid::ObjectId;

use crate::error::{EngineError, FieldProblem, ProblemReason};
use crate::pipeline::{Accumulator, Expr, Pipeline};
use crate::schema::{EntityKind, Layout, SchemaRegistry};
use crate::store::{Direction, Predicate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Report {
    /// Number of forum posts written by one user.
    PostsByUser,
    /// Posts with their comment count, most commented first. Posts without
    /// comments are listed with a count of 0.
    PopularPosts,
    AverageComments,
    AverageQuestions,
    /// Comment count per post. Only posts with at least one comment get a
    /// row.
    CommentCounts,
}

impl Report {
    pub const ALL: [Report; 5] = [
        Report::PostsByUser,
        Report::PopularPosts,
        Report::AverageComments,
        Report::AverageQuestions,
        Report::CommentCounts,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Report::PostsByUser => "posts-by-user",
            Report::PopularPosts => "popular-posts",
            Report::AverageComments => "average-comments",
            Report::AverageQuestions => "average-questions",
            Report::CommentCounts => "comment-counts",
        }
    }

    pub fn needs_user(self) -> bool {
        self == Report::PostsByUser
    }

    /// Builds the pipeline for the registry's layout.
    pub fn pipeline(
        self,
        registry: &SchemaRegistry,
        user: Option<ObjectId>,
    ) -> Result<Pipeline, EngineError> {
        let user = match (self.needs_user(), user) {
            (true, None) => {
                return Err(EngineError::validation(FieldProblem::new(
                    None,
                    Some(EntityKind::User),
                    "user",
                    ProblemReason::Missing,
                )))
            }
            (_, user) => user,
        };

        Ok(match registry.layout() {
            Layout::Normalized => normalized(self, user),
            Layout::Denormalized => denormalized(self, registry, user)?,
        })
    }
}

impl Display for Report {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Report {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('_', "-");
        Report::ALL
            .into_iter()
            .find(|report| report.name() == wanted)
            .ok_or_else(|| format!("unknown report '{}'", s))
    }
}

fn normalized(report: Report, user: Option<ObjectId>) -> Pipeline {
    let posts = || Pipeline::on_entity(EntityKind::ForumPost);
    let with_comments = || posts().lookup(EntityKind::ForumComment.name(), "_id", "forumPost_id", "comments");

    match report {
        Report::PostsByUser => posts()
            .matching(Predicate::eq("user_id", user))
            .count("total_posts"),
        Report::PopularPosts => with_comments()
            .add_field("comment_count", Expr::size("comments"))
            .project(&["title", "comment_count"])
            .sort_by("comment_count", Direction::Desc),
        Report::AverageComments => with_comments().group(
            None,
            vec![("average_comments", Accumulator::Avg(Expr::size("comments")))],
        ),
        Report::AverageQuestions => Pipeline::on_entity(EntityKind::TestQuestion)
            .lookup(EntityKind::Question.name(), "_id", "testQuestion_id", "questions")
            .group(
                None,
                vec![("average_questions", Accumulator::Avg(Expr::size("questions")))],
            ),
        Report::CommentCounts => Pipeline::on_entity(EntityKind::ForumComment).group(
            Some(Expr::field("forumPost_id")),
            vec![("comment_count", Accumulator::Count)],
        ),
    }
}

/// Path of an embedded entity's array inside its root document.
fn array_path(registry: &SchemaRegistry, kind: EntityKind) -> Result<String, EngineError> {
    Ok(registry
        .location(kind)?
        .prefix
        .trim_end_matches('.')
        .to_string())
}

fn denormalized(
    report: Report,
    registry: &SchemaRegistry,
    user: Option<ObjectId>,
) -> Result<Pipeline, EngineError> {
    let posts = array_path(registry, EntityKind::ForumPost)?;
    let comments = array_path(registry, EntityKind::ForumComment)?;
    let post_field = |field: &str| format!("{}.{}", posts, field);
    let classrooms = Pipeline::on_location(registry.location(EntityKind::Classroom)?);

    Ok(match report {
        Report::PostsByUser => classrooms
            .unwind(posts.as_str())
            .matching(Predicate::eq(post_field("user_id"), user))
            .count("total_posts"),
        Report::PopularPosts => classrooms
            .unwind(posts.as_str())
            .add_field("_id", Expr::field(post_field("_id")))
            .add_field("title", Expr::field(post_field("title")))
            .add_field("comment_count", Expr::size(comments.as_str()))
            .project(&["title", "comment_count"])
            .sort_by("comment_count", Direction::Desc),
        Report::AverageComments => classrooms.unwind(posts.as_str()).group(
            None,
            vec![("average_comments", Accumulator::Avg(Expr::size(comments.as_str())))],
        ),
        Report::AverageQuestions => {
            let tests = array_path(registry, EntityKind::TestQuestion)?;
            let questions = array_path(registry, EntityKind::Question)?;
            classrooms.unwind(tests).group(
                None,
                vec![("average_questions", Accumulator::Avg(Expr::size(questions)))],
            )
        }
        Report::CommentCounts => classrooms
            .unwind(posts.as_str())
            .unwind(comments.as_str())
            .group(
                Some(Expr::field(post_field("_id"))),
                vec![("comment_count", Accumulator::Count)],
            ),
    })
}
