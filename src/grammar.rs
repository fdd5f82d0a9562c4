use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::Error;
use crate::rules::{Production, Rule, Symbol};

lazy_static! {
  static ref NONTERMINAL_TOKEN: Regex = Regex::new(r"<[^<>\s]+>").unwrap();
}

/// True if `s` has the `<name>` shape rules use for nonterminal references.
pub fn looks_like_nonterminal(s: &str) -> bool {
  s.starts_with('<') && s.ends_with('>') && s.len() > 2
}

/// Splits a single alternative string into the terminal/nonterminal
/// productions it decomposes into: nonterminal references are written
/// `<name>`, and every other run of characters (including the empty run,
/// for the empty alternative) is a terminal literal.
pub fn tokenize(alt: &str) -> Vec<Production> {
  let mut productions = Vec::new();
  let mut last = 0;
  for m in NONTERMINAL_TOKEN.find_iter(alt) {
    if m.start() > last {
      productions.push(Production::Terminal(alt[last..m.start()].to_string()));
    }
    productions.push(Production::Nonterminal(Symbol::new(m.as_str().to_string())));
    last = m.end();
  }
  if last < alt.len() || productions.is_empty() {
    productions.push(Production::Terminal(alt[last..].to_string()));
  }
  productions
}

#[derive(Debug)]
pub struct Grammar {
  pub start: String,
  pub rules: HashMap<String, Vec<Rc<Rule>>>,
  nullables: HashSet<String>,
  nonterminals: HashSet<String>,
}

impl Clone for Grammar {
  fn clone(&self) -> Self {
    Self {
      start: self.start.clone(),
      rules: self.rules.clone(),
      nullables: self.nullables.clone(),
      nonterminals: self.nonterminals.clone(),
    }
  }
}

impl std::fmt::Display for Grammar {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    writeln!(f, "//** start: {}", self.start)?;
    write!(f, "//** nullables:")?;
    for nt in self.nullables.iter() {
      write!(f, " {}", nt)?;
    }
    writeln!(f)?;
    for rule in self.rules.values().flatten() {
      writeln!(f, "{}", rule)?;
    }
    Ok(())
  }
}

impl Grammar {
  /// Builds a grammar from already-parsed rules. The first rule's symbol
  /// is the start symbol, matching `FromStr`'s convention.
  pub fn new(rules: Vec<Rule>) -> Result<Self, Error> {
    if rules.is_empty() {
      return Err(Error::Grammar("empty ruleset".into()));
    }

    let start = rules[0].symbol.name.clone();
    let nonterminals: HashSet<String> = rules.iter().map(|r| r.symbol.name.clone()).collect();

    for rule in &rules {
      for p in &rule.productions {
        if let Production::Nonterminal(s) = p {
          if !nonterminals.contains(&s.name) {
            return Err(Error::Grammar(format!(
              "rule for {} references undefined nonterminal {}",
              rule.symbol, s
            )));
          }
        }
      }
    }

    let rules: HashMap<String, Vec<Rc<Rule>>> =
      rules.into_iter().fold(HashMap::new(), |mut map, rule| {
        map.entry(rule.symbol.name.clone()).or_insert_with(Vec::new).push(Rc::new(rule));
        map
      });

    let nullables = Self::find_nullables(&rules);

    Ok(Self { start, rules, nonterminals, nullables })
  }

  /// Builds a grammar from a plain nonterminal-to-alternatives mapping,
  /// the external interface's canonical input shape (4.C / §6). `order`
  /// fixes rule iteration order and supplies the start symbol as its
  /// first element; `map` holds, for each nonterminal in `order`, its
  /// ordered list of alternative strings.
  pub fn from_map(
    order: Vec<String>,
    mut map: HashMap<String, Vec<String>>,
  ) -> Result<Self, Error> {
    let mut rules = Vec::new();
    for nt in &order {
      let alts = map.remove(nt).ok_or_else(|| {
        Error::Grammar(format!("no alternatives given for nonterminal {}", nt))
      })?;
      for alt in alts {
        rules.push(Rule::new(Symbol::new(nt.clone()), tokenize(&alt)));
      }
    }
    Self::new(rules)
  }

  pub fn is_nullable(&self, s: &str) -> bool {
    self.nullables.contains(s)
  }

  pub fn is_nonterminal(&self, s: &str) -> bool {
    self.nonterminals.contains(s)
  }

  pub fn nonterminals(&self) -> impl Iterator<Item = &String> {
    self.nonterminals.iter()
  }

  pub fn rules_for(&self, symbol: &str) -> &[Rc<Rule>] {
    self.rules.get(symbol).map(|v| v.as_slice()).unwrap_or(&[])
  }

  /// A view of this grammar with its start symbol overridden, used to
  /// re-parse a solved SMT string against a single nonterminal's
  /// language rather than the whole grammar's (4.F tree-grafting step).
  pub fn with_start(&self, start: &str) -> Self {
    Self { start: start.to_string(), ..self.clone() }
  }

  fn rule_is_nullable(nullables: &HashSet<String>, rule: &Rule) -> bool {
    rule.is_empty()
      || rule.productions.iter().all(|p| match p {
        Production::Nonterminal(s) => nullables.contains(&s.name),
        Production::Terminal(s) => s.is_empty(),
      })
  }

  fn find_nullables(rules: &HashMap<String, Vec<Rc<Rule>>>) -> HashSet<String> {
    let mut nullables: HashSet<String> = HashSet::new();

    let mut last_length = usize::MAX;
    while last_length != nullables.len() {
      last_length = nullables.len();
      for r in rules.values().flatten() {
        if !nullables.contains(&r.symbol.name) && Self::rule_is_nullable(&nullables, r) {
          nullables.insert(r.symbol.name.clone());
        }
      }
    }

    nullables
  }
}

impl FromStr for Grammar {
  type Err = Error;

  /// Parses the crate's plain-text grammar format:
  ///
  /// ```text
  /// <start> ::= <var> ;
  /// <var> ::= a | b | c ;
  /// ```
  ///
  /// Rules are `;`-terminated; alternatives within a rule are `|`-separated
  /// and tokenized with [`tokenize`]. The first rule's symbol becomes the
  /// start symbol.
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let mut rules = Vec::new();

    for stmt in s.split(';') {
      let stmt = stmt.trim();
      if stmt.is_empty() {
        continue;
      }
      let (head, body) = stmt.split_once("::=").ok_or_else(|| {
        Error::Grammar(format!("rule missing '::=': {:?}", stmt))
      })?;
      let head = head.trim();
      if head.is_empty() {
        return Err(Error::Grammar("rule has an empty head".into()));
      }
      for alt in body.split('|') {
        rules.push(Rule::new(Symbol::new(head.to_string()), tokenize(alt.trim())));
      }
    }

    Grammar::new(rules)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn tokenizes_mixed_alternative() {
    let prods = tokenize("<term> + <expr>");
    assert_eq!(
      prods,
      vec![
        Production::Nonterminal(Symbol::new("<term>".into())),
        Production::Terminal(" + ".into()),
        Production::Nonterminal(Symbol::new("<expr>".into())),
      ]
    );
  }

  #[test]
  fn tokenizes_plain_terminal() {
    assert_eq!(tokenize("a"), vec![Production::Terminal("a".into())]);
  }

  #[test]
  fn tokenizes_empty_alternative_as_empty_terminal() {
    assert_eq!(tokenize(""), vec![Production::Terminal("".into())]);
  }

  #[test]
  fn parses_grammar_text_and_finds_start() {
    let g: Grammar = "<start> ::= <var> ; <var> ::= a | b | c ;".parse().unwrap();
    assert_eq!(g.start, "<start>");
    assert_eq!(g.rules_for("<var>").len(), 3);
  }

  #[test]
  fn finds_nullables_by_fixed_point() {
    let g: Grammar = "<s> ::= <a><b>; <a> ::= c; <b> ::= <d><d>; <d> ::= ;".parse().unwrap();
    assert!(g.is_nullable("<b>"));
    assert!(g.is_nullable("<d>"));
    assert!(!g.is_nullable("<a>"));
    assert!(!g.is_nullable("<s>"));
  }

  #[test]
  fn rejects_reference_to_undefined_nonterminal() {
    let err = Grammar::new(vec![Rule::new(
      Symbol::new("<s>".into()),
      vec![Production::Nonterminal(Symbol::new("<missing>".into()))],
    )])
    .unwrap_err();
    assert!(matches!(err, Error::Grammar(_)));
  }

  #[test]
  fn from_map_builds_same_grammar_as_text() {
    let mut map = HashMap::new();
    map.insert("<start>".to_string(), vec!["<var>".to_string()]);
    map.insert(
      "<var>".to_string(),
      vec!["a".to_string(), "b".to_string(), "c".to_string()],
    );
    let g = Grammar::from_map(
      vec!["<start>".to_string(), "<var>".to_string()],
      map,
    )
    .unwrap();
    assert_eq!(g.start, "<start>");
    assert_eq!(g.rules_for("<var>").len(), 3);
  }
}
