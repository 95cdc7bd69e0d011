//! Reference word list for comprehensibility scoring.

use std::collections::HashSet;
use std::path::Path;

/// Common English words; a configured word file extends this list.
const BUILTIN_WORDS: &str = "
a able about above accept access account across act action active activity actually add
added address after again against age ago agree ahead air all allow almost alone along
already also always am among amount an analysis and another answer any anyone anything app
application apply are area argument around art article as ask at attention author available
away back bad base based be became because become been before begin behind being believe
below best better between big bill book both box break bring build business but button by
call came can cannot car care case cause center certain change chapter check child choose
class clear click close code come comment common company compare complete computer consider
contact content continue control copy correct cost could country course create current
customer data date day deal decide default delete design detail develop did difference
different direct do document does done down draft during each early easy edit effect either
else email end enough enter error even event ever every example expect experience explain
fact family far feature feel few field figure file final find first fix focus follow for
form found free friend from full function future game general get give go good great group
grow had half hand happen hard has have he head hear help her here high him his history
hold home hour how however idea if image important in include increase information input
inside instead into is issue it item its job just keep key kind know language large last
late later lead learn least leave left less let letter level life like line link list
little live local long look lot low made main make many market may me mean meeting member
message method might mind minute model moment money month more most move much must my name
need network never new news next no not note nothing now number of off offer office often
old on once one only open option or order other our out output over own page paper part
people per person place plan play point possible post power present price problem process
product program project provide public put question quick read ready real reason receive
record report request research result return review right run said same save say school
screen search second section see seem select send sense server service set several share
she should show side sign simple since site small so software some something source space
start state step still stop story study subject such summary support sure system table take
talk task team tell term test text than thank that the their them then there these they
thing think this those though thought three through time title to today together too tool
top total track true try turn two type under understand until up update upon us use user
value version very view want was watch water way we web week well were what when where
whether which while who whole why will window with within without word work world would
write year yes yet you your
";

#[derive(Debug, Clone, Default)]
pub struct Lexicon {
    words: HashSet<String>,
}

impl Lexicon {
    pub fn builtin() -> Self {
        Self::from_words(BUILTIN_WORDS.split_whitespace())
    }

    pub fn from_words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut lexicon = Self::default();
        lexicon.extend(words);
        lexicon
    }

    pub fn extend<I, S>(&mut self, words: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for w in words {
            let w = w.as_ref().trim().to_lowercase();
            if !w.is_empty() {
                self.words.insert(w);
            }
        }
    }

    /// Built-in list plus one word per line from `path`.
    pub fn with_file(path: &Path) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut lexicon = Self::builtin();
        lexicon.extend(content.lines());
        Ok(lexicon)
    }

    /// Case-insensitive; regular plural and verb endings match their stem.
    pub fn contains(&self, word: &str) -> bool {
        let lower = word.to_lowercase();
        if self.words.contains(&lower) {
            return true;
        }
        ["s", "es", "ed", "ing"].iter().any(|suffix| {
            lower.strip_suffix(suffix).is_some_and(|stem| {
                stem.len() > 1
                    && (self.words.contains(stem) || self.words.contains(&format!("{stem}e")))
            })
        })
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn builtin_knows_common_words() {
        let lexicon = Lexicon::builtin();
        assert!(lexicon.contains("The"));
        assert!(lexicon.contains("report"));
        assert!(lexicon.contains("reports"));
        assert!(lexicon.contains("closing"));
        assert!(!lexicon.contains("xqzv"));
    }

    #[test]
    fn file_extends_builtin() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "rustacean\n\n  borrowck  ").unwrap();
        let lexicon = Lexicon::with_file(file.path()).unwrap();
        assert!(lexicon.contains("rustacean"));
        assert!(lexicon.contains("borrowck"));
        assert!(lexicon.contains("the"));
        assert!(lexicon.len() > Lexicon::builtin().len());
    }
}
