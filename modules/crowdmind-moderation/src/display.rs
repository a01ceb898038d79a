//! Read-side helpers for showing analysed comments.
//!
//! Ordering is a view: it returns positions into the stored sequence and
//! never reorders the sequence itself.

use std::cmp::Reverse;

use crowdmind_common::{AnalysisStatus, Comment, CommentAnalysis, Thread};

/// Comment positions ordered by descending relevance. Comments without a
/// completed relevance score come last; ties keep their stored order.
pub fn relevance_order(comments: &[Comment]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..comments.len()).collect();
    order.sort_by_key(|&i| Reverse(display_score(&comments[i].analysis)));
    order
}

fn display_score(analysis: &CommentAnalysis) -> Option<u8> {
    match analysis.relevance_status {
        AnalysisStatus::Completed => analysis.relevance_score,
        _ => None,
    }
}

pub fn analysis_at(thread: &Thread, comment_index: usize) -> Option<&CommentAnalysis> {
    thread.comments.get(comment_index).map(|c| &c.analysis)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(text: &str, score: Option<u8>) -> Comment {
        let mut comment = Comment::new("user", text);
        if let Some(score) = score {
            comment.analysis.relevance_score = Some(score);
            comment.analysis.relevance_status = AnalysisStatus::Completed;
        }
        comment
    }

    #[test]
    fn highest_relevance_first_unscored_last() {
        let comments = vec![
            scored("a", Some(20)),
            scored("b", None),
            scored("c", Some(90)),
            scored("d", Some(55)),
        ];
        assert_eq!(relevance_order(&comments), vec![2, 3, 0, 1]);
    }

    #[test]
    fn ties_keep_stored_order() {
        let comments = vec![
            scored("a", Some(60)),
            scored("b", None),
            scored("c", Some(60)),
            scored("d", None),
        ];
        assert_eq!(relevance_order(&comments), vec![0, 2, 1, 3]);
    }

    #[test]
    fn failed_relevance_with_stale_score_sorts_as_unscored() {
        let mut failed = scored("a", Some(99));
        failed.analysis.relevance_status = AnalysisStatus::Failed;
        let comments = vec![failed, scored("b", Some(10))];
        assert_eq!(relevance_order(&comments), vec![1, 0]);
    }

    #[test]
    fn ordering_leaves_stored_sequence_alone() {
        let mut thread = Thread::new("t1", "Thread");
        thread.push_comment(scored("low", Some(5)));
        thread.push_comment(scored("high", Some(95)));
        let before = thread.comments.clone();

        let order = relevance_order(&thread.comments);

        assert_eq!(order, vec![1, 0]);
        assert_eq!(thread.comments, before);
        assert_eq!(analysis_at(&thread, 1).unwrap().relevance_score, Some(95));
        assert!(analysis_at(&thread, 2).is_none());
    }
}
