use serde::Serialize;

/// Whoever a submission counts for on the leaderboard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Participant {
    User(u32),
    Team(u32),
}

impl Participant {
    /// Team submissions count for the team, all others for the user
    pub fn of(user_id: u32, team_id: Option<u32>) -> Self {
        team_id.map_or(Self::User(user_id), Self::Team)
    }

    pub fn kind(self) -> &'static str {
        match self {
            Self::User(_) => "user",
            Self::Team(_) => "team",
        }
    }

    pub fn id(self) -> u32 {
        match self {
            Self::User(id) | Self::Team(id) => id,
        }
    }
}

/// Aggregated best scores of one participant in one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderboardEntry {
    pub participant: Participant,
    pub total_score: u32,
    pub problems_solved: u32,
    pub last_submission: String,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Standing {
    pub rank: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<u32>,
    pub total_score: u32,
    pub problems_solved: u32,
    pub last_submission: String,
}

/// Sorts entries by total score, then by earlier last submission
///
/// Entries equal on both keys share a rank, and the next rank skips
/// accordingly (1, 1, 3).
pub fn rank_entries(mut entries: Vec<LeaderboardEntry>) -> Vec<Standing> {
    entries.sort_by(|a, b| {
        b.total_score
            .cmp(&a.total_score)
            .then_with(|| a.last_submission.cmp(&b.last_submission))
            .then_with(|| a.participant.id().cmp(&b.participant.id()))
    });

    let mut standings: Vec<Standing> = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        let tied = index > 0
            && entries[index - 1].total_score == entry.total_score
            && entries[index - 1].last_submission == entry.last_submission;
        let rank = match standings.last() {
            Some(prev) if tied => prev.rank,
            _ => index as u32 + 1,
        };

        let (user_id, team_id) = match entry.participant {
            Participant::User(id) => (Some(id), None),
            Participant::Team(id) => (None, Some(id)),
        };
        standings.push(Standing {
            rank,
            user_id,
            team_id,
            total_score: entry.total_score,
            problems_solved: entry.problems_solved,
            last_submission: entry.last_submission.clone(),
        });
    }

    standings
}
