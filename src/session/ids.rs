//! Human-readable exercise ids
//!
//! Participants join with a 6-digit id, trainers with an 8-digit one, so the
//! role can be told from the id alone.

use rand::Rng;

use super::exercise::ExerciseIds;

pub const PARTICIPANT_ID_LENGTH: usize = 6;
pub const TRAINER_ID_LENGTH: usize = 8;

fn random_digits(rng: &mut impl Rng, length: usize) -> String {
    (0..length)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

/// Draw a fresh id pair, skipping any id for which `taken` returns true.
///
/// Gives up after `attempts` draws and returns `None`: the id space is
/// considered exhausted.
pub fn generate_exercise_ids(
    rng: &mut impl Rng,
    attempts: usize,
    taken: impl Fn(&str) -> bool,
) -> Option<ExerciseIds> {
    let participant_id = (0..attempts)
        .map(|_| random_digits(rng, PARTICIPANT_ID_LENGTH))
        .find(|id| !taken(id))?;
    let trainer_id = (0..attempts)
        .map(|_| random_digits(rng, TRAINER_ID_LENGTH))
        .find(|id| !taken(id))?;
    Some(ExerciseIds {
        trainer_id,
        participant_id,
    })
}

/// Does `id` look like an exercise id at all?
pub fn is_well_formed(id: &str) -> bool {
    (id.len() == PARTICIPANT_ID_LENGTH || id.len() == TRAINER_ID_LENGTH)
        && id.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn ids_have_role_specific_lengths() {
        let mut rng = StdRng::seed_from_u64(7);
        let ids = generate_exercise_ids(&mut rng, 10, |_| false).unwrap();
        assert_eq!(ids.participant_id.len(), 6);
        assert_eq!(ids.trainer_id.len(), 8);
        assert!(is_well_formed(&ids.participant_id));
        assert!(is_well_formed(&ids.trainer_id));
    }

    #[test]
    fn exhausted_space_yields_none() {
        let mut rng = StdRng::seed_from_u64(7);
        assert!(generate_exercise_ids(&mut rng, 5, |_| true).is_none());
    }

    #[test]
    fn malformed_ids_are_recognised() {
        assert!(!is_well_formed("12345"));
        assert!(!is_well_formed("12a456"));
        assert!(is_well_formed("12345678"));
    }
}
